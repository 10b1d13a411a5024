// src/backend/spawn.rs

//! Backend child process
//!
//! One [`BackendProcess`] exists per running transaction. It owns the child,
//! feeds it stdin, hands out stdout one line at a time and remembers when the
//! backend last showed signs of life. Interpreting those lines is the
//! transaction runner's job.
//!
//! The child runs with a cleared environment: only `PATH`, the client hints,
//! the transaction id and the descriptor's own variables are passed on.

use super::BackendDescriptor;
use super::codec::encode_command;
use crate::error::{Error, Result};
use crate::role::{Params, Role};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Environment variable carrying the transaction id
pub const TRANSACTION_ID_ENV: &str = "PKGD_TRANSACTION_ID";

/// `PATH` used when the daemon itself has none
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Bytes of stderr kept for diagnostics
const STDERR_LIMIT: usize = 64 * 1024;

/// How a backend process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by this signal
    Signaled(i32),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(signal)) => ExitOutcome::Signaled(signal),
            (None, None) => ExitOutcome::Exited(-1),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit code {}", code),
            ExitOutcome::Signaled(signal) => match Signal::try_from(*signal) {
                Ok(sig) => write!(f, "killed by {}", sig.as_str()),
                Err(_) => write!(f, "killed by signal {}", signal),
            },
        }
    }
}

/// Longest stdout line accepted from a backend, terminator included
pub const MAX_LINE_LENGTH: usize = 256 * 1024;

/// What a backend did next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutput {
    /// One line of stdout, without its terminator
    Line(String),
    /// The backend process exited; stdout may still hold unread lines
    Exited(ExitOutcome),
    /// Stdout is closed
    Closed,
}

/// Line splitter over backend stdout with a length cap
///
/// Bytes past [`MAX_LINE_LENGTH`] are discarded up to the next newline and
/// the line is reported as oversized.
struct LineReader {
    stdout: BufReader<ChildStdout>,
    buf: Vec<u8>,
    overflow: usize,
    last_activity: Instant,
}

impl LineReader {
    /// `Ok(Some(Err(len)))` is an oversized line of `len` bytes
    ///
    /// Cancel safe: consumed bytes are kept in `buf` between calls.
    async fn next_line(&mut self) -> std::io::Result<Option<std::result::Result<String, usize>>> {
        loop {
            let chunk = self.stdout.fill_buf().await?;
            if chunk.is_empty() {
                if self.buf.is_empty() && self.overflow == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.take()));
            }

            let (part, complete) = match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => (&chunk[..=i], true),
                None => (chunk, false),
            };
            let used = part.len();
            let room = MAX_LINE_LENGTH.saturating_sub(self.buf.len());
            if used <= room {
                self.buf.extend_from_slice(part);
            } else {
                self.buf.extend_from_slice(&part[..room]);
                self.overflow += used - room;
            }
            self.stdout.consume(used);
            self.last_activity = Instant::now();

            if complete {
                return Ok(Some(self.take()));
            }
        }
    }

    fn take(&mut self) -> std::result::Result<String, usize> {
        let mut bytes = std::mem::take(&mut self.buf);
        let overflow = std::mem::take(&mut self.overflow);
        if overflow > 0 {
            return Err(bytes.len() + overflow);
        }
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A running backend
///
/// The backend leads its own process group, so signals reach any helpers it
/// started as well.
pub struct BackendProcess {
    backend: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: LineReader,
    stderr: Arc<Mutex<String>>,
    exit: Option<ExitOutcome>,
    inactivity_timeout: Duration,
}

impl BackendProcess {
    /// Spawn the backend for a role
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        descriptor: &BackendDescriptor,
        role: Role,
        params: &Params,
        transaction_id: &str,
        inactivity_timeout: Duration,
    ) -> Result<Self> {
        let argv = encode_command(role, params);
        let path = std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into());

        debug!(
            "Spawning backend {}: {} {:?} {:?}",
            descriptor.name,
            descriptor.command.display(),
            descriptor.args,
            argv
        );

        let mut child = Command::new(&descriptor.command)
            .args(&descriptor.args)
            .args(&argv)
            .env_clear()
            .env("PATH", path)
            .envs(params.hints.to_env())
            .env(TRANSACTION_ID_ENV, transaction_id)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                backend: descriptor.name.clone(),
                reason: e.to_string(),
            })?;

        let missing = |stream: &str| Error::Spawn {
            backend: descriptor.name.clone(),
            reason: format!("{} was not captured", stream),
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let stdin = child.stdin.take();

        let stderr = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&stderr);
        let name = descriptor.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{}] {}", name, line);
                let mut buf = sink.lock();
                if buf.len() + line.len() < STDERR_LIMIT {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
        });

        Ok(Self {
            backend: descriptor.name.clone(),
            pid: child.id(),
            child,
            stdin,
            stdout: LineReader {
                stdout: BufReader::new(stdout),
                buf: Vec::new(),
                overflow: 0,
                last_activity: Instant::now(),
            },
            stderr,
            exit: None,
            inactivity_timeout,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the process has been reaped
    pub fn exit(&self) -> Option<ExitOutcome> {
        self.exit
    }

    /// Next line of stdout, without its terminator
    ///
    /// Returns `None` once stdout is closed, and [`Error::LineTooLong`] for a
    /// line over [`MAX_LINE_LENGTH`]; reading can go on after that. Cancel
    /// safe: a partially read line is kept and completed by the next call.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        match self.stdout.next_line().await? {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(length)) => Err(Error::LineTooLong {
                backend: self.backend.clone(),
                length,
            }),
            None => Ok(None),
        }
    }

    /// Next line of stdout or the exit of the process, whichever comes first
    ///
    /// Pending lines win over the exit notification. Once the exit has been
    /// reported this only reads stdout. Cancel safe.
    pub async fn next_output(&mut self) -> Result<BackendOutput> {
        if self.exit.is_some() {
            let line = self.stdout.next_line().await?;
            return self.line_output(line);
        }
        tokio::select! {
            biased;
            line = self.stdout.next_line() => self.line_output(line?),
            status = self.child.wait() => {
                let exit = ExitOutcome::from(status?);
                self.exit = Some(exit);
                Ok(BackendOutput::Exited(exit))
            }
        }
    }

    fn line_output(
        &self,
        line: Option<std::result::Result<String, usize>>,
    ) -> Result<BackendOutput> {
        match line {
            Some(Ok(line)) => Ok(BackendOutput::Line(line)),
            Some(Err(length)) => Err(Error::LineTooLong {
                backend: self.backend.clone(),
                length,
            }),
            None => Ok(BackendOutput::Closed),
        }
    }

    /// Write one line to the backend's stdin
    pub async fn send_stdin(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "backend stdin is closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        self.stdout.last_activity = Instant::now();
        Ok(())
    }

    /// Close stdin so the backend sees EOF
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn last_activity(&self) -> Instant {
        self.stdout.last_activity
    }

    /// Point in time at which the backend counts as hung
    pub fn deadline(&self) -> Instant {
        self.stdout.last_activity + self.inactivity_timeout
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Diagnostics the backend wrote to stderr so far
    pub fn stderr(&self) -> String {
        self.stderr.lock().clone()
    }

    /// Wait for the process to exit, at most `limit`
    pub async fn wait_or_timeout(&mut self, limit: Duration) -> Result<Option<ExitOutcome>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(status) => {
                let exit = ExitOutcome::from(status?);
                self.exit = Some(exit);
                Ok(Some(exit))
            }
            Err(_) => Ok(None),
        }
    }

    /// Send a signal to the backend's whole process group
    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => debug!("Sent {} to backend {} (group {})", signal.as_str(), self.backend, pid),
            // group already empty
            Err(Errno::ESRCH) => {}
            Err(e) => debug!("{} to group {} failed: {}", signal.as_str(), pid, e),
        }
    }

    /// Kill helpers the backend left running after it exited
    pub fn kill_leftovers(&self) {
        self.signal_group(Signal::SIGKILL);
    }

    /// Ask the backend to stop, then force it after `grace`
    ///
    /// Sends SIGTERM to the process group, waits up to `grace` and sends
    /// SIGKILL if the backend is still alive. Returns once the backend has
    /// been reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitOutcome> {
        if let Some(exit) = self.exit {
            self.kill_leftovers();
            return Ok(exit);
        }
        if let Some(status) = self.child.try_wait()? {
            let exit = ExitOutcome::from(status);
            self.exit = Some(exit);
            self.kill_leftovers();
            return Ok(exit);
        }

        self.close_stdin();
        self.signal_group(Signal::SIGTERM);

        if let Some(exit) = self.wait_or_timeout(grace).await? {
            self.kill_leftovers();
            return Ok(exit);
        }

        warn!(
            "Backend {} ignored SIGTERM for {:?}, killing",
            self.backend, grace
        );
        self.kill().await
    }

    /// Kill the backend and its process group immediately and reap it
    pub async fn kill(&mut self) -> Result<ExitOutcome> {
        self.close_stdin();
        self.signal_group(Signal::SIGKILL);
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if let Err(e) = self.child.start_kill() {
            debug!("Kill of backend {} failed: {}", self.backend, e);
        }
        let exit = ExitOutcome::from(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        // kill_on_drop only covers the leader
        if self.exit.is_none() {
            self.signal_group(Signal::SIGKILL);
        }
    }
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("backend", &self.backend)
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> BackendDescriptor {
        let path = dir.path().join("backend.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        BackendDescriptor::new("test", path).with_roles([Role::RefreshCache])
    }

    #[test]
    fn test_exit_outcome_from_status() {
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(0)), ExitOutcome::Exited(0));
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(3 << 8)), ExitOutcome::Exited(3));
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(9)), ExitOutcome::Signaled(9));
        assert_eq!(ExitOutcome::Signaled(9).to_string(), "killed by SIGKILL");
        assert!(ExitOutcome::Exited(0).success());
    }

    #[tokio::test]
    async fn test_reads_lines_and_env() {
        let dir = TempDir::new().unwrap();
        let desc = script(
            &dir,
            "printf 'status\\t%s\\n' \"$1\"\nprintf 'message\\tid\\t%s\\n' \"$PKGD_TRANSACTION_ID\"\nprintf 'noeol'",
        )
        .with_env("EXTRA", "1");
        let mut process = BackendProcess::start(
            &desc,
            Role::RefreshCache,
            &Params::new(),
            "tx-1",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(process.read_line().await.unwrap().unwrap(), "status\trefresh-cache");
        assert_eq!(process.read_line().await.unwrap().unwrap(), "message\tid\ttx-1");
        assert_eq!(process.read_line().await.unwrap().unwrap(), "noeol");
        assert!(process.read_line().await.unwrap().is_none());

        let exit = process.wait_or_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, Some(ExitOutcome::Exited(0)));
    }

    #[tokio::test]
    async fn test_stdin_and_stderr() {
        let dir = TempDir::new().unwrap();
        let desc = script(&dir, "read answer\necho \"got $answer\"\necho oops >&2\nexit 4");
        let mut process = BackendProcess::start(
            &desc,
            Role::RefreshCache,
            &Params::new(),
            "tx-2",
            Duration::from_secs(5),
        )
        .unwrap();

        process.send_stdin("yes").await.unwrap();
        assert_eq!(process.read_line().await.unwrap().unwrap(), "got yes");
        assert!(process.read_line().await.unwrap().is_none());
        let exit = process.wait_or_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, Some(ExitOutcome::Exited(4)));

        // stderr is drained by a separate task
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(process.stderr().contains("oops"));
    }

    fn start(desc: &BackendDescriptor, id: &str) -> BackendProcess {
        BackendProcess::start(desc, Role::RefreshCache, &Params::new(), id, Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_terminate_escalates() {
        let dir = TempDir::new().unwrap();
        let desc = script(&dir, "trap '' TERM\nprintf 'ready\\n'\nwhile true; do sleep 1; done");
        let mut process = start(&desc, "tx-3");

        // the trap is installed once the script has printed
        assert_eq!(process.read_line().await.unwrap().unwrap(), "ready");

        let exit = process.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(exit, ExitOutcome::Signaled(9));
    }

    #[tokio::test]
    async fn test_terminate_reaches_helpers() {
        let dir = TempDir::new().unwrap();
        let desc = script(&dir, "sleep 30 &\nprintf 'ready\\n'\nwait");
        let mut process = start(&desc, "tx-5");

        assert_eq!(process.read_line().await.unwrap().unwrap(), "ready");
        process.terminate(Duration::from_millis(500)).await.unwrap();

        // the helper shared stdout; it is closed only if the helper died too
        let eof = tokio::time::timeout(Duration::from_secs(2), process.read_line())
            .await
            .expect("helper still holds stdout");
        assert!(eof.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_output_reports_exit_while_stdout_is_held() {
        let dir = TempDir::new().unwrap();
        let desc = script(&dir, "printf 'one\\n'\n(sleep 30) &\nexit 0");
        let mut process = start(&desc, "tx-6");

        assert_eq!(
            process.next_output().await.unwrap(),
            BackendOutput::Line("one".to_string())
        );
        let next = tokio::time::timeout(Duration::from_secs(2), process.next_output())
            .await
            .expect("exit not reported");
        assert_eq!(next.unwrap(), BackendOutput::Exited(ExitOutcome::Exited(0)));
        assert_eq!(process.exit(), Some(ExitOutcome::Exited(0)));

        process.kill_leftovers();
        let closed = tokio::time::timeout(Duration::from_secs(2), process.next_output())
            .await
            .expect("leftover helper survived");
        assert_eq!(closed.unwrap(), BackendOutput::Closed);
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let desc = script(
            &dir,
            "head -c 300000 /dev/zero | tr '\\0' a\necho\nprintf 'ok\\n'",
        );
        let mut process = start(&desc, "tx-7");

        match process.read_line().await {
            Err(Error::LineTooLong { length, .. }) => assert_eq!(length, 300_001),
            other => panic!("expected LineTooLong, got {:?}", other),
        }
        assert_eq!(process.read_line().await.unwrap().unwrap(), "ok");
        assert!(process.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let desc = BackendDescriptor::new("missing", "/nonexistent/pkgd-backend");
        let err = BackendProcess::start(
            &desc,
            Role::RefreshCache,
            &Params::new(),
            "tx-4",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
