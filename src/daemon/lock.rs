// src/daemon/lock.rs

//! Lifetime lock: at most one pkgd instance per lock file
//!
//! Two daemons supervising the same package managers would run non-reentrant
//! backends side by side, so the daemon takes an exclusive `flock` at startup
//! and keeps it until it exits. The holder's PID is written next to the lock
//! for diagnostics.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive lock held for the daemon's lifetime
pub struct DaemonLock {
    /// Kept open to hold the lock
    _file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Default lock location
    pub const DEFAULT_PATH: &'static str = "/run/pkgd/pkgd.lock";

    /// Take the lock without blocking
    ///
    /// Fails with [`Error::AlreadyRunning`] if another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired daemon lock at {}", path.display());
                let lock = Self { _file: file, path };
                lock.write_pid()?;
                Ok(lock)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Daemon lock already held at {}", path.display());
                Err(Error::AlreadyRunning(path.display().to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Whether some process holds the lock
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let Ok(file) = File::open(path.as_ref()) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    /// PID recorded by the current holder, if any
    pub fn holder_pid<P: AsRef<Path>>(path: P) -> Option<u32> {
        fs::read_to_string(path.as_ref().with_extension("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_pid(&self) -> Result<()> {
        fs::write(self.path.with_extension("pid"), std::process::id().to_string())?;
        Ok(())
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.with_extension("pid"));
        info!("Released daemon lock at {}", self.path.display());
    }
}
