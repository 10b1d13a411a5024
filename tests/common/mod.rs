// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! Backends are small `/bin/sh` scripts written into a temporary directory.
//! They are run through `/bin/sh <script>` rather than executed directly, so
//! a script that was just written is never exec'd while another test thread
//! still holds it open.

#![allow(dead_code)]

use pkgd::daemon::DaemonConfig;
use pkgd::{
    BackendDescriptor, BackendRegistry, PackageId, TransactionEvent, TransactionQueue,
    TransactionState,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// A set of fake backends living in one temporary directory
pub struct Backends {
    pub dir: TempDir,
}

impl Backends {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Write `body` as a shell script and describe it as a backend
    pub fn script(&self, name: &str, body: &str) -> BackendDescriptor {
        let path = self.dir.path().join(format!("{}.sh", name));
        std::fs::write(&path, body).unwrap();
        BackendDescriptor::new(name, "/bin/sh").with_args([path.to_string_lossy().into_owned()])
    }

    /// Path inside the fixture directory, for pid or log files
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Engine settings with short kill grace and long retention
pub fn config() -> DaemonConfig {
    DaemonConfig::default()
        .with_inactivity_timeout(Duration::from_secs(10))
        .with_kill_grace(Duration::from_millis(200))
        .with_retention(Duration::from_secs(60))
}

pub fn registry(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for descriptor in descriptors {
        registry.register(descriptor).unwrap();
    }
    registry
}

/// Queue on the current runtime
pub fn queue(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> TransactionQueue {
    TransactionQueue::new(registry(descriptors), config()).unwrap()
}

pub fn pkg(id: &str) -> PackageId {
    PackageId::parse(id).unwrap()
}

/// State changes in an event list, in order
pub fn states(events: &[TransactionEvent]) -> Vec<TransactionState> {
    events
        .iter()
        .filter_map(|e| match e {
            TransactionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

/// Read a pid written by a backend script, waiting for the file to appear
pub async fn read_pid(path: &std::path::Path) -> i32 {
    for _ in 0..100 {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(pid) = content.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no pid written to {}", path.display());
}
