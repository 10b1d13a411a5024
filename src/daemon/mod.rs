// src/daemon/mod.rs

//! pkgd engine: transaction queue, configuration and daemon plumbing
//!
//! The daemon owns the set of registered backends and a single
//! [`TransactionQueue`] through which every request flows. Front ends (the
//! `pkgd` binary, a bus service, tests) talk to the queue; the queue talks to
//! backends through supervised child processes.
//!
//! ```text
//! client                       TransactionQueue                 backend
//!   │ commit(role, params) ──────►│ validate, wait for slot         │
//!   │◄── id ──────────────────────┤                                 │
//!   │ subscribe(id) ─────────────►│ spawn ────────────────────────►│
//!   │◄────── transaction events ──┤◄──────────── stdout lines ──────┤
//! ```
//!
//! # Module Structure
//!
//! - `queue` - admission, scheduling and the public engine API
//! - `config` - TOML configuration file
//! - `lock` - single-instance lifetime lock
//! - `auth` - privilege check applied before commit

pub mod auth;
pub mod config;
pub mod lock;
pub mod queue;

pub use auth::{AllowAll, PrivilegeCheck, ReadOnly};
pub use config::PkgdConfig;
pub use lock::DaemonLock;
pub use queue::{TransactionQueue, TransactionResult};

use crate::transaction::{Outcome, TransactionId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// What to do with a request when no slot is free
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Hold it in the waiting group (up to `max_waiting`)
    #[default]
    Queue,
    /// Refuse it
    Reject,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Transactions running at once across all backends
    pub max_active: usize,
    /// Transactions allowed to wait for a slot
    pub max_waiting: usize,
    pub wait_policy: WaitPolicy,
    /// Silence after which a backend counts as hung
    pub inactivity_timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// How long finished transactions stay listed
    pub retention: Duration,
    /// Unparseable lines tolerated before the backend is stopped
    pub max_malformed_lines: usize,
    /// Path to daemon lock file
    pub lock_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_active: 4,
            max_waiting: 64,
            wait_policy: WaitPolicy::Queue,
            inactivity_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            retention: Duration::from_secs(5),
            max_malformed_lines: 64,
            lock_path: PathBuf::from(DaemonLock::DEFAULT_PATH),
        }
    }
}

impl DaemonConfig {
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active.max(1);
        self
    }

    pub fn with_max_waiting(mut self, max_waiting: usize) -> Self {
        self.max_waiting = max_waiting;
        self
    }

    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait_policy = policy;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_malformed_lines(mut self, limit: usize) -> Self {
        self.max_malformed_lines = limit;
        self
    }

    pub fn with_lock_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.lock_path = path.into();
        self
    }
}

/// Queue-level events, broadcast to every watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Transaction committed and waiting (position 0 = next in line)
    Queued { id: TransactionId, position: usize },
    /// Transaction got a slot and its backend is starting
    Started { id: TransactionId, backend: String },
    /// Transaction reached its terminal state
    Finished { id: TransactionId, outcome: Outcome },
    /// The set of listed transactions changed
    ListChanged { ids: Vec<TransactionId> },
}

/// Engine counters
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Transactions accepted
    pub submitted: AtomicU64,
    /// Requests refused before commit
    pub rejected: AtomicU64,
    /// Transactions currently running
    pub running: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl QueueMetrics {
    pub(crate) fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Failed(_) => &self.failed,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub running: u64,
    pub waiting: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::ErrorKind;
    use std::str::FromStr;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.max_active, 4);
        assert_eq!(config.wait_policy, WaitPolicy::Queue);
        assert_eq!(config.retention, Duration::from_secs(5));
        assert_eq!(config.max_malformed_lines, 64);
        assert_eq!(config.lock_path, PathBuf::from("/run/pkgd/pkgd.lock"));
    }

    #[test]
    fn test_config_builders() {
        let config = DaemonConfig::default()
            .with_max_active(0)
            .with_wait_policy(WaitPolicy::Reject)
            .with_kill_grace(Duration::from_millis(100));
        assert_eq!(config.max_active, 1);
        assert_eq!(config.wait_policy, WaitPolicy::Reject);
        assert_eq!(config.kill_grace, Duration::from_millis(100));
    }

    #[test]
    fn test_wait_policy_names() {
        assert_eq!(WaitPolicy::from_str("reject").unwrap(), WaitPolicy::Reject);
        assert_eq!(WaitPolicy::Queue.to_string(), "queue");
    }

    #[test]
    fn test_queue_event_serialization() {
        let event = QueueEvent::Finished {
            id: "tx-1".to_string(),
            outcome: Outcome::failed(ErrorKind::Timeout, None, "silent"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"finished\""));
        assert!(json.contains("tx-1"));

        let event = QueueEvent::Queued {
            id: "tx-2".to_string(),
            position: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("queued"));
        assert!(json.contains("\"position\":3"));
    }

    #[test]
    fn test_metrics_record_outcome() {
        let metrics = QueueMetrics::default();
        metrics.record_outcome(&Outcome::Success);
        metrics.record_outcome(&Outcome::Cancelled);
        metrics.record_outcome(&Outcome::Cancelled);
        assert_eq!(metrics.succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cancelled.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.failed.load(Ordering::Relaxed), 0);
    }
}
