// src/transaction/mod.rs

//! Transactions: one role executed by one backend process
//!
//! A [`Transaction`] owns its role and parameters (fixed at construction),
//! its lifecycle state, live progress and accumulated results. It fans every
//! accepted backend event out to its subscribers in arrival order.
//!
//! # Transaction Lifecycle
//!
//! ```text
//! NEW -> COMMITTED -> RUNNING -> FINISHED(success | failed | cancelled)
//!          |                        ^
//!          +------------------------+  cancelled while waiting
//! ```
//!
//! States only move forward. A finished transaction stays finished; later
//! requests against it are no-ops.

pub mod results;
pub(crate) mod runner;

pub use results::{
    ErrorKind, ErrorResult, ExitReport, Outcome, TransactionError, TransactionResults,
    interpret_exit,
};

use crate::backend::{BackendDescriptor, BackendEvent, FinishedStatus, Status};
use crate::role::{Params, Role};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque transaction identifier (UUID v4)
pub type TransactionId = String;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Constructed, not yet validated
    New,
    /// Validated and waiting for a slot
    Committed,
    /// Backend process is running
    Running,
    /// Terminal
    Finished(FinishedStatus),
}

impl TransactionState {
    fn rank(self) -> u8 {
        match self {
            TransactionState::New => 0,
            TransactionState::Committed => 1,
            TransactionState::Running => 2,
            TransactionState::Finished(_) => 3,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Finished(_))
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::New => f.write_str("new"),
            TransactionState::Committed => f.write_str("committed"),
            TransactionState::Running => f.write_str("running"),
            TransactionState::Finished(status) => write!(f, "finished({})", status),
        }
    }
}

/// Event delivered to transaction subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransactionEvent {
    StateChanged(TransactionState),
    /// A backend event, republished verbatim
    Backend(BackendEvent),
    /// Always the last event of a subscription
    Finished(Outcome),
}

/// What a cancel request amounts to for a running transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    /// The backend may be interrupted now
    Now,
    /// Remembered until the backend allows cancellation
    Deferred,
    /// Nothing left to cancel
    AlreadyFinished,
}

/// Point-in-time view of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub role: Role,
    pub state: TransactionState,
    pub backend: Option<String>,
    /// `None` while progress is unknown
    pub percentage: Option<u8>,
    pub subpercentage: u8,
    pub status: Status,
    pub allow_cancel: bool,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: TransactionState,
    backend: Option<Arc<BackendDescriptor>>,
    percentage: Option<u8>,
    last_known_percentage: u8,
    subpercentage: u8,
    status: Status,
    allow_cancel: bool,
    cancel_requested: bool,
    results: TransactionResults,
    outcome: Option<Outcome>,
    subscribers: Vec<mpsc::UnboundedSender<TransactionEvent>>,
    committed_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn publish(&mut self, event: TransactionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn advance(&mut self, to: TransactionState) -> bool {
        if self.state.is_finished() || to.rank() <= self.state.rank() {
            return false;
        }
        self.state = to;
        self.publish(TransactionEvent::StateChanged(to));
        true
    }
}

/// A package operation and everything observed while it runs
pub struct Transaction {
    id: TransactionId,
    role: Role,
    params: Params,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl Transaction {
    /// Create a transaction in state `New`
    pub fn new(role: Role, params: Params) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            params,
            created_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: TransactionState::New,
                backend: None,
                percentage: None,
                last_known_percentage: 0,
                subpercentage: 0,
                status: Status::Unknown,
                allow_cancel: true,
                cancel_requested: false,
                results: TransactionResults::default(),
                outcome: None,
                subscribers: Vec::new(),
                committed_at: None,
                started_at: None,
                finished_at: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Backend chosen at commit time
    pub fn backend(&self) -> Option<Arc<BackendDescriptor>> {
        self.inner.lock().backend.clone()
    }

    /// Current `(percentage, subpercentage)`
    pub fn progress(&self) -> (Option<u8>, u8) {
        let inner = self.inner.lock();
        (inner.percentage, inner.subpercentage)
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    pub fn allow_cancel(&self) -> bool {
        self.inner.lock().allow_cancel
    }

    /// Snapshot of the results gathered so far
    pub fn results(&self) -> TransactionResults {
        self.inner.lock().results.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome.clone()
    }

    pub fn info(&self) -> TransactionInfo {
        let inner = self.inner.lock();
        TransactionInfo {
            id: self.id.clone(),
            role: self.role,
            state: inner.state,
            backend: inner.backend.as_ref().map(|b| b.name.clone()),
            percentage: inner.percentage,
            subpercentage: inner.subpercentage,
            status: inner.status,
            allow_cancel: inner.allow_cancel,
            created_at: self.created_at,
            committed_at: inner.committed_at,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }

    /// Observe this transaction
    ///
    /// A live subscription starts with the current state. Subscribing to a
    /// finished transaction yields only its `Finished` event.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        match inner.outcome {
            Some(ref outcome) => {
                let _ = tx.send(TransactionEvent::Finished(outcome.clone()));
            }
            None => {
                let _ = tx.send(TransactionEvent::StateChanged(inner.state));
                inner.subscribers.push(tx);
            }
        }
        Subscription {
            id: self.id.clone(),
            rx,
        }
    }

    /// New -> Committed, binding the backend that will run the role
    pub(crate) fn commit(&self, backend: Arc<BackendDescriptor>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::New {
            return false;
        }
        inner.allow_cancel = backend.cancellable;
        inner.backend = Some(backend);
        inner.committed_at = Some(Utc::now());
        inner.advance(TransactionState::Committed)
    }

    /// Committed -> Running
    pub(crate) fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Committed {
            return false;
        }
        inner.started_at = Some(Utc::now());
        inner.advance(TransactionState::Running)
    }

    /// Take in one decoded backend event
    ///
    /// Returns `false` if the event was dropped (progress going backwards, or
    /// the transaction is not running).
    pub(crate) fn apply(&self, event: BackendEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Running {
            debug!("Transaction {}: ignoring {} outside running state", self.id, event.keyword());
            return false;
        }

        match event {
            BackendEvent::Percentage(Some(value)) => {
                if value < inner.last_known_percentage {
                    warn!(
                        "Transaction {}: percentage went backwards ({} -> {}), dropping",
                        self.id, inner.last_known_percentage, value
                    );
                    return false;
                }
                if value > inner.last_known_percentage {
                    inner.subpercentage = 0;
                }
                inner.last_known_percentage = value;
                inner.percentage = Some(value);
            }
            BackendEvent::Percentage(None) => inner.percentage = None,
            BackendEvent::Subpercentage(value) => {
                if value < inner.subpercentage {
                    warn!(
                        "Transaction {}: subpercentage went backwards ({} -> {}), dropping",
                        self.id, inner.subpercentage, value
                    );
                    return false;
                }
                inner.subpercentage = value;
            }
            BackendEvent::Status(status) => inner.status = status,
            BackendEvent::AllowCancel(allow) => inner.allow_cancel = allow,
            ref other => {
                inner.results.record(other);
            }
        }

        inner.publish(TransactionEvent::Backend(event));
        true
    }

    /// Register a cancel request for a running transaction
    pub(crate) fn request_cancel(&self) -> CancelDecision {
        let mut inner = self.inner.lock();
        if inner.state.is_finished() {
            return CancelDecision::AlreadyFinished;
        }
        inner.cancel_requested = true;
        if inner.allow_cancel {
            CancelDecision::Now
        } else {
            CancelDecision::Deferred
        }
    }

    /// Whether a remembered cancel request can be honoured now
    pub(crate) fn take_deferred_cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.cancel_requested && inner.allow_cancel && !inner.state.is_finished() {
            inner.cancel_requested = false;
            return true;
        }
        false
    }

    /// Move to the terminal state and close every subscription
    ///
    /// Returns `false` if the transaction had already finished.
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_finished() {
            return false;
        }
        inner.finished_at = Some(Utc::now());
        inner.advance(TransactionState::Finished(outcome.finished_status()));
        inner.publish(TransactionEvent::Finished(outcome.clone()));
        inner.outcome = Some(outcome);
        inner.subscribers.clear();
        true
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Receiving end of a transaction's event stream
///
/// Ends after the `Finished` event.
#[derive(Debug)]
pub struct Subscription {
    id: TransactionId,
    rx: mpsc::UnboundedReceiver<TransactionEvent>,
}

impl Subscription {
    pub fn transaction_id(&self) -> &str {
        &self.id
    }

    /// Next event, or `None` once the stream is over
    pub async fn recv(&mut self) -> Option<TransactionEvent> {
        self.rx.recv().await
    }

    /// Drain events until the transaction finishes
    pub async fn wait(mut self) -> Option<Outcome> {
        while let Some(event) = self.rx.recv().await {
            if let TransactionEvent::Finished(outcome) = event {
                return Some(outcome);
            }
        }
        None
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<TransactionEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::PackageId;

    fn backend(cancellable: bool) -> Arc<BackendDescriptor> {
        Arc::new(
            BackendDescriptor::new("dummy", "/bin/true")
                .with_roles([Role::InstallPackages])
                .with_cancellable(cancellable),
        )
    }

    fn running() -> Transaction {
        let id = PackageId::parse("foo;1.0;x86_64;repo").unwrap();
        let tx = Transaction::new(
            Role::InstallPackages,
            Params::new().with_package_ids([id]),
        );
        assert!(tx.commit(backend(true)));
        assert!(tx.start());
        tx
    }

    fn drain(sub: &mut Subscription) -> Vec<TransactionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = sub.rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let tx = Transaction::new(Role::RefreshCache, Params::new());
        assert_eq!(tx.state(), TransactionState::New);
        assert!(!tx.start());
        assert!(tx.commit(backend(true)));
        assert!(!tx.commit(backend(true)));
        assert!(tx.start());
        assert!(!tx.start());
        assert!(tx.finish(Outcome::Success));
        assert!(!tx.finish(Outcome::Cancelled));
        assert_eq!(
            tx.state(),
            TransactionState::Finished(FinishedStatus::Success)
        );
        assert_eq!(tx.outcome(), Some(Outcome::Success));
    }

    #[test]
    fn test_subscriber_sees_full_sequence() {
        let tx = Transaction::new(Role::RefreshCache, Params::new());
        let mut sub = tx.subscribe();
        tx.commit(backend(true));
        tx.start();
        tx.apply(BackendEvent::Status(Status::RefreshCache));
        tx.finish(Outcome::Success);

        let events = drain(&mut sub);
        assert_eq!(
            events,
            vec![
                TransactionEvent::StateChanged(TransactionState::New),
                TransactionEvent::StateChanged(TransactionState::Committed),
                TransactionEvent::StateChanged(TransactionState::Running),
                TransactionEvent::Backend(BackendEvent::Status(Status::RefreshCache)),
                TransactionEvent::StateChanged(TransactionState::Finished(
                    FinishedStatus::Success
                )),
                TransactionEvent::Finished(Outcome::Success),
            ]
        );
        // channel closed after Finished
        assert!(matches!(
            sub.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_subscribe_after_finish() {
        let tx = running();
        tx.finish(Outcome::Cancelled);
        let mut sub = tx.subscribe();
        assert_eq!(
            drain(&mut sub),
            vec![TransactionEvent::Finished(Outcome::Cancelled)]
        );
    }

    #[test]
    fn test_percentage_never_decreases() {
        let tx = running();
        assert!(tx.apply(BackendEvent::Percentage(Some(40))));
        assert!(tx.apply(BackendEvent::Subpercentage(50)));
        assert!(!tx.apply(BackendEvent::Percentage(Some(30))));
        assert!(!tx.apply(BackendEvent::Subpercentage(20)));
        assert_eq!(tx.progress(), (Some(40), 50));

        // unknown progress is allowed, and does not reset the floor
        assert!(tx.apply(BackendEvent::Percentage(None)));
        assert_eq!(tx.progress(), (None, 50));
        assert!(!tx.apply(BackendEvent::Percentage(Some(10))));
        assert!(tx.apply(BackendEvent::Percentage(Some(60))));
        assert_eq!(tx.progress(), (Some(60), 0));
    }

    #[test]
    fn test_results_recorded() {
        let tx = running();
        tx.apply(BackendEvent::Error {
            code: "no-network".to_string(),
            detail: "offline".to_string(),
        });
        assert_eq!(tx.results().errors.len(), 1);
    }

    #[test]
    fn test_deferred_cancel() {
        let tx = Transaction::new(Role::RefreshCache, Params::new());
        tx.commit(backend(true));
        tx.start();
        tx.apply(BackendEvent::AllowCancel(false));

        assert_eq!(tx.request_cancel(), CancelDecision::Deferred);
        assert!(!tx.take_deferred_cancel());
        tx.apply(BackendEvent::AllowCancel(true));
        assert!(tx.take_deferred_cancel());
        assert!(!tx.take_deferred_cancel());

        tx.finish(Outcome::Cancelled);
        assert_eq!(tx.request_cancel(), CancelDecision::AlreadyFinished);
    }

    #[test]
    fn test_commit_takes_backend_cancellability() {
        let tx = Transaction::new(Role::RefreshCache, Params::new());
        tx.commit(backend(false));
        assert!(!tx.allow_cancel());
        assert_eq!(tx.info().backend.as_deref(), Some("dummy"));
    }

    #[test]
    fn test_events_ignored_unless_running() {
        let tx = Transaction::new(Role::RefreshCache, Params::new());
        assert!(!tx.apply(BackendEvent::Percentage(Some(10))));
        assert_eq!(tx.progress(), (None, 0));
    }
}
