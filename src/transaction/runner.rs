// src/transaction/runner.rs

//! Supervision of one running transaction
//!
//! The runner owns the backend process for the lifetime of a transaction. It
//! multiplexes stdout lines and the exit of the child, the inactivity
//! deadline, and control messages from the queue (cancel, stdin input,
//! shutdown). Once the child has exited, stdout is drained for at most the
//! kill grace before the exit is interpreted. It always ends by finishing the
//! transaction and reaping the child.

use super::{CancelDecision, ErrorKind, ExitReport, Outcome, Transaction, interpret_exit};
use crate::backend::{
    BackendDescriptor, BackendEvent, BackendOutput, BackendProcess, ExitOutcome, FinishedStatus,
    decode_line,
};
use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Requests the queue can send to a running transaction
#[derive(Debug)]
pub(crate) enum Control {
    Cancel,
    Input(String),
    Shutdown,
}

/// Limits applied while supervising a backend
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunSettings {
    pub inactivity_timeout: Duration,
    pub kill_grace: Duration,
    pub max_malformed_lines: usize,
}

/// Run a committed transaction to completion
///
/// The transaction must already be `Running`. Returns the outcome it was
/// finished with.
pub(crate) async fn run(
    tx: Arc<Transaction>,
    backend: Arc<BackendDescriptor>,
    settings: RunSettings,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> Outcome {
    let timeout = backend
        .inactivity_timeout
        .unwrap_or(settings.inactivity_timeout);

    let mut process = match BackendProcess::start(&backend, tx.role(), tx.params(), tx.id(), timeout) {
        Ok(process) => process,
        Err(e) => {
            warn!("Transaction {}: {}", tx.id(), e);
            let outcome = Outcome::failed(
                ErrorKind::BackendFailure,
                Some(super::results::INTERNAL_ERROR_CODE.to_string()),
                e.to_string(),
            );
            tx.finish(outcome.clone());
            return outcome;
        }
    };

    info!(
        "Transaction {} running {} on backend {} (pid {:?})",
        tx.id(),
        tx.role(),
        backend.name,
        process.pid()
    );

    let outcome = supervise(&tx, &mut process, &settings, &mut control).await;

    info!("Transaction {} finished: {}", tx.id(), outcome);
    tx.finish(outcome.clone());
    outcome
}

async fn supervise(
    tx: &Transaction,
    process: &mut BackendProcess,
    settings: &RunSettings,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> Outcome {
    let mut supervisor = Supervisor {
        tx,
        settings,
        finished: None,
        malformed: 0,
    };
    let mut control_open = true;

    loop {
        let deadline = process.deadline();
        tokio::select! {
            output = process.next_output() => match output {
                Ok(BackendOutput::Line(line)) => {
                    if let Some(outcome) = supervisor.on_line(process, &line).await {
                        return outcome;
                    }
                }
                Ok(BackendOutput::Exited(exit)) => {
                    debug!("Transaction {}: backend {}", tx.id(), exit);
                    if let Some(outcome) = supervisor.drain(process).await {
                        return outcome;
                    }
                    return supervisor.conclude(process, exit);
                }
                Ok(BackendOutput::Closed) => break,
                Err(e @ Error::LineTooLong { .. }) => {
                    if let Some(outcome) = supervisor.on_malformed(process, &e.to_string()).await {
                        return outcome;
                    }
                }
                Err(e) => {
                    warn!("Transaction {}: reading backend output failed: {}", tx.id(), e);
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "Transaction {}: backend {} silent for {:?}, terminating",
                    tx.id(),
                    process.backend(),
                    process.inactivity_timeout()
                );
                terminate(process, settings).await;
                return Outcome::failed(
                    ErrorKind::Timeout,
                    None,
                    format!("no output from backend for {:?}", process.inactivity_timeout()),
                );
            }
            message = control.recv(), if control_open => match message {
                Some(Control::Cancel) => match tx.request_cancel() {
                    CancelDecision::Now => return cancel(process, settings).await,
                    CancelDecision::Deferred => {
                        info!("Transaction {}: cancel deferred until backend allows it", tx.id());
                    }
                    CancelDecision::AlreadyFinished => {}
                },
                Some(Control::Input(line)) => {
                    if let Err(e) = process.send_stdin(&line).await {
                        warn!("Transaction {}: writing to backend stdin failed: {}", tx.id(), e);
                    }
                }
                Some(Control::Shutdown) => {
                    info!("Transaction {}: engine shutting down", tx.id());
                    return cancel(process, settings).await;
                }
                None => control_open = false,
            },
        }
    }

    // stdout is closed; the process should be on its way out
    let exit = match process.wait_or_timeout(process.inactivity_timeout()).await {
        Ok(Some(exit)) => exit,
        Ok(None) => {
            warn!(
                "Transaction {}: backend closed stdout but did not exit",
                tx.id()
            );
            terminate(process, settings).await;
            return Outcome::failed(
                ErrorKind::Timeout,
                None,
                "backend closed its output but did not exit",
            );
        }
        Err(e) => {
            terminate(process, settings).await;
            return Outcome::failed(ErrorKind::BackendFailure, None, e.to_string());
        }
    };

    debug!("Transaction {}: backend {}", tx.id(), exit);
    supervisor.conclude(process, exit)
}

/// Per-transaction protocol state shared by the main loop and the final drain
struct Supervisor<'a> {
    tx: &'a Transaction,
    settings: &'a RunSettings,
    finished: Option<FinishedStatus>,
    malformed: usize,
}

impl Supervisor<'_> {
    /// Apply one stdout line; `Some` ends the transaction
    async fn on_line(&mut self, process: &mut BackendProcess, line: &str) -> Option<Outcome> {
        debug!("[{}] {}", process.backend(), line);
        match decode_line(line) {
            Ok(event) => {
                if let BackendEvent::Finished(status) = event {
                    self.finished = Some(status);
                }
                self.tx.apply(event);
                if self.tx.take_deferred_cancel() {
                    info!(
                        "Transaction {}: backend allows cancel, honouring request",
                        self.tx.id()
                    );
                    return Some(cancel(process, self.settings).await);
                }
                None
            }
            Err(e) => self.on_malformed(process, &format!("{} ({:?})", e, line)).await,
        }
    }

    async fn on_malformed(&mut self, process: &mut BackendProcess, reason: &str) -> Option<Outcome> {
        self.malformed += 1;
        warn!(
            "Transaction {}: dropping line from {}: {}",
            self.tx.id(),
            process.backend(),
            reason
        );
        if self.malformed > self.settings.max_malformed_lines {
            terminate(process, self.settings).await;
            return Some(Outcome::failed(
                ErrorKind::ProtocolViolation,
                None,
                format!("backend sent {} malformed lines", self.malformed),
            ));
        }
        None
    }

    /// Read what the exited backend left in its stdout, for at most the kill grace
    ///
    /// Helpers that still hold stdout open after that are killed.
    async fn drain(&mut self, process: &mut BackendProcess) -> Option<Outcome> {
        let until = Instant::now() + self.settings.kill_grace;
        loop {
            match tokio::time::timeout_at(until, process.next_output()).await {
                Ok(Ok(BackendOutput::Line(line))) => {
                    if let Some(outcome) = self.on_line(process, &line).await {
                        return Some(outcome);
                    }
                }
                Ok(Ok(BackendOutput::Closed)) => return None,
                Ok(Ok(BackendOutput::Exited(_))) => {}
                Ok(Err(e @ Error::LineTooLong { .. })) => {
                    if let Some(outcome) = self.on_malformed(process, &e.to_string()).await {
                        return Some(outcome);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Transaction {}: reading backend output failed: {}", self.tx.id(), e);
                    process.kill_leftovers();
                    return None;
                }
                Err(_) => {
                    warn!(
                        "Transaction {}: backend {} exited but its stdout is still open, killing leftover processes",
                        self.tx.id(),
                        process.backend()
                    );
                    process.kill_leftovers();
                    return None;
                }
            }
        }
    }

    /// Outcome of a backend that exited on its own
    fn conclude(&self, process: &BackendProcess, exit: ExitOutcome) -> Outcome {
        let results = self.tx.results();
        let stderr = process.stderr();
        interpret_exit(&ExitReport {
            finished: self.finished,
            exit,
            errors: &results.errors,
            last_status: self.tx.status(),
            stderr: &stderr,
        })
    }
}

async fn cancel(process: &mut BackendProcess, settings: &RunSettings) -> Outcome {
    terminate(process, settings).await;
    Outcome::Cancelled
}

async fn terminate(process: &mut BackendProcess, settings: &RunSettings) {
    match process.terminate(settings.kill_grace).await {
        Ok(exit) => debug!("Backend {} stopped: {}", process.backend(), exit),
        Err(e) => warn!("Failed to stop backend {}: {}", process.backend(), e),
    }
}
