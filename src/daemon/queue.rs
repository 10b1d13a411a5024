// src/daemon/queue.rs

//! Transaction queue: admission, scheduling and the public engine API
//!
//! Every request enters through [`TransactionQueue::submit`] (or the
//! [`commit`](TransactionQueue::commit) shorthand). Valid requests are
//! committed and placed in the waiting group; the scheduler moves waiters to
//! the active group when both the global ceiling and their backend's own
//! ceiling allow it. Waiters for the same backend start in commit order.
//!
//! All list mutations happen under one mutex. A transaction's own lock is
//! only ever taken while holding the queue lock, never the other way round.

use super::auth::{AllowAll, PrivilegeCheck};
use super::{DaemonConfig, MetricsSnapshot, QueueEvent, QueueMetrics, WaitPolicy};
use crate::backend::{BackendDescriptor, BackendRegistry, codec};
use crate::error::{Error, Rejection, Result};
use crate::role::{Params, Role};
use crate::transaction::runner::{self, Control, RunSettings};
use crate::transaction::{
    Outcome, Subscription, Transaction, TransactionId, TransactionInfo, TransactionResults,
    TransactionState,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the queue event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result lookup for a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionResult {
    /// Not finished yet
    Pending(TransactionState),
    Finished {
        outcome: Outcome,
        results: TransactionResults,
    },
}

struct Waiter {
    tx: Arc<Transaction>,
    backend: Arc<BackendDescriptor>,
}

struct ActiveSlot {
    tx: Arc<Transaction>,
    backend: String,
    control: mpsc::UnboundedSender<Control>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    /// Listed transactions, in commit order
    entries: Vec<Arc<Transaction>>,
    waiting: VecDeque<Waiter>,
    active: HashMap<TransactionId, ActiveSlot>,
    shutting_down: bool,
}

impl QueueState {
    fn running_on(&self, backend: &str) -> usize {
        self.active.values().filter(|s| s.backend == backend).count()
    }

    fn has_room(&self, backend: &BackendDescriptor, max_active: usize) -> bool {
        self.active.len() < max_active
            && backend
                .max_concurrent
                .is_none_or(|limit| self.running_on(&backend.name) < limit)
    }

    fn find(&self, id: &str) -> Option<&Arc<Transaction>> {
        self.entries.iter().find(|t| t.id() == id)
    }

    fn ids(&self) -> Vec<TransactionId> {
        self.entries.iter().map(|t| t.id().to_string()).collect()
    }
}

struct Shared {
    handle: Handle,
    registry: BackendRegistry,
    config: DaemonConfig,
    privilege: RwLock<Arc<dyn PrivilegeCheck>>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    metrics: QueueMetrics,
}

/// The engine's single entry point
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct TransactionQueue {
    shared: Arc<Shared>,
}

impl TransactionQueue {
    /// Create a queue that runs transactions on the current tokio runtime
    pub fn new(registry: BackendRegistry, config: DaemonConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(Self::with_handle(handle, registry, config))
    }

    /// Create a queue that runs transactions on the given runtime
    ///
    /// Lets the queue be driven from threads outside the runtime.
    pub fn with_handle(handle: Handle, registry: BackendRegistry, config: DaemonConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                handle,
                registry,
                config,
                privilege: RwLock::new(Arc::new(AllowAll)),
                state: Mutex::new(QueueState::default()),
                events,
                metrics: QueueMetrics::default(),
            }),
        }
    }

    /// Replace the privilege check applied before commit
    pub fn set_privilege_check<P: PrivilegeCheck + 'static>(&self, check: P) {
        *self.shared.privilege.write() = Arc::new(check);
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.shared.config
    }

    /// Create and submit a transaction
    pub fn commit(&self, role: Role, params: Params) -> Result<TransactionId> {
        self.submit(Arc::new(Transaction::new(role, params)))
    }

    /// Validate, commit and enqueue a transaction
    ///
    /// The transaction may be subscribed to beforehand to observe its full
    /// state sequence. Rejections leave it in state `New`.
    pub fn submit(&self, tx: Arc<Transaction>) -> Result<TransactionId> {
        match self.admit(tx) {
            Ok(id) => Ok(id),
            Err(rejection) => {
                self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                info!("Rejected transaction: {}", rejection);
                Err(Error::Rejected(rejection))
            }
        }
    }

    fn admit(&self, tx: Arc<Transaction>) -> std::result::Result<TransactionId, Rejection> {
        let id = tx.id().to_string();
        let role = tx.role();

        if tx.state() != TransactionState::New {
            return Err(Rejection::AlreadySubmitted(id));
        }

        let backend = self.shared.registry.select(role, tx.params())?;
        codec::check_params(role, tx.params()).map_err(|reason| Rejection::invalid(role, reason))?;

        let check = Arc::clone(&self.shared.privilege.read());
        check
            .check(role, tx.params())
            .map_err(|reason| Rejection::NotAuthorized { role, reason })?;

        let config = &self.shared.config;
        let mut state = self.shared.state.lock();

        if state.shutting_down {
            return Err(Rejection::ShuttingDown);
        }

        let must_wait = !state.has_room(&backend, config.max_active)
            || state.waiting.iter().any(|w| w.backend.name == backend.name);
        if must_wait
            && (config.wait_policy == WaitPolicy::Reject
                || state.waiting.len() >= config.max_waiting)
        {
            return Err(Rejection::QueueFull {
                waiting: state.waiting.len(),
            });
        }

        if !tx.commit(Arc::clone(&backend)) {
            return Err(Rejection::AlreadySubmitted(id));
        }

        info!(
            "Committed transaction {} ({} on {})",
            id, role, backend.name
        );
        self.shared.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        state.entries.push(Arc::clone(&tx));
        state.waiting.push_back(Waiter { tx, backend });
        self.emit(QueueEvent::Queued {
            id: id.clone(),
            position: state.waiting.len() - 1,
        });
        self.schedule(&mut state);
        self.emit(QueueEvent::ListChanged { ids: state.ids() });

        Ok(id)
    }

    /// Start every waiter that fits, oldest first
    fn schedule(&self, state: &mut QueueState) {
        if state.shutting_down {
            return;
        }

        let max_active = self.shared.config.max_active;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut index = 0;

        while index < state.waiting.len() && state.active.len() < max_active {
            let waiter = &state.waiting[index];
            if blocked.contains(&waiter.backend.name) || !state.has_room(&waiter.backend, max_active)
            {
                blocked.insert(waiter.backend.name.clone());
                index += 1;
                continue;
            }
            if let Some(waiter) = state.waiting.remove(index) {
                self.launch(state, waiter);
            }
        }
    }

    fn launch(&self, state: &mut QueueState, waiter: Waiter) {
        let Waiter { tx, backend } = waiter;
        if !tx.start() {
            warn!("Transaction {} was not startable ({})", tx.id(), tx.state());
            return;
        }

        let id = tx.id().to_string();
        let config = &self.shared.config;
        let settings = RunSettings {
            inactivity_timeout: config.inactivity_timeout,
            kill_grace: config.kill_grace,
            max_malformed_lines: config.max_malformed_lines,
        };
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let queue = self.clone();
        let task_tx = Arc::clone(&tx);
        let task_backend = Arc::clone(&backend);
        let task_id = id.clone();
        let task = self.shared.handle.spawn(async move {
            let outcome = runner::run(task_tx, task_backend, settings, control_rx).await;
            queue.complete(&task_id, outcome);
        });

        debug!("Started transaction {} on {}", id, backend.name);
        self.shared.metrics.running.fetch_add(1, Ordering::Relaxed);
        state.active.insert(
            id.clone(),
            ActiveSlot {
                tx,
                backend: backend.name.clone(),
                control: control_tx,
                task: Some(task),
            },
        );
        self.emit(QueueEvent::Started {
            id,
            backend: backend.name.clone(),
        });
    }

    /// Release the slot of a finished transaction and admit the next waiter
    fn complete(&self, id: &str, outcome: Outcome) {
        let mut state = self.shared.state.lock();
        if state.active.remove(id).is_some() {
            self.shared.metrics.running.fetch_sub(1, Ordering::Relaxed);
        }
        self.shared.metrics.record_outcome(&outcome);
        self.emit(QueueEvent::Finished {
            id: id.to_string(),
            outcome,
        });
        self.schedule(&mut state);
        drop(state);

        self.schedule_eviction(id.to_string());
    }

    fn schedule_eviction(&self, id: TransactionId) {
        let retention = self.shared.config.retention;
        if retention.is_zero() {
            self.evict(&id);
            return;
        }
        let queue = self.clone();
        self.shared.handle.spawn(async move {
            tokio::time::sleep(retention).await;
            queue.evict(&id);
        });
    }

    fn evict(&self, id: &str) {
        let mut state = self.shared.state.lock();
        let before = state.entries.len();
        state.entries.retain(|t| t.id() != id);
        if state.entries.len() != before {
            debug!("Evicted transaction {}", id);
            self.emit(QueueEvent::ListChanged { ids: state.ids() });
        }
    }

    fn emit(&self, event: QueueEvent) {
        // no watchers is fine
        let _ = self.shared.events.send(event);
    }

    /// Observe a listed transaction
    pub fn subscribe(&self, id: &str) -> Result<Subscription> {
        let state = self.shared.state.lock();
        state
            .find(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Look up a listed transaction
    pub fn transaction(&self, id: &str) -> Option<Arc<Transaction>> {
        self.shared.state.lock().find(id).cloned()
    }

    /// Cancel a transaction
    ///
    /// A waiting transaction is finished as cancelled right away. A running
    /// one is interrupted as soon as its backend allows it. Cancelling a
    /// finished transaction does nothing.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut state = self.shared.state.lock();

        if let Some(pos) = state.waiting.iter().position(|w| w.tx.id() == id) {
            if let Some(waiter) = state.waiting.remove(pos) {
                info!("Cancelled waiting transaction {}", id);
                waiter.tx.finish(Outcome::Cancelled);
                self.shared.metrics.record_outcome(&Outcome::Cancelled);
                self.emit(QueueEvent::Finished {
                    id: id.to_string(),
                    outcome: Outcome::Cancelled,
                });
                self.schedule(&mut state);
                drop(state);
                self.schedule_eviction(id.to_string());
            }
            return Ok(());
        }

        if let Some(slot) = state.active.get(id) {
            debug!("Forwarding cancel to transaction {}", id);
            let _ = slot.control.send(Control::Cancel);
            return Ok(());
        }

        if state.find(id).is_some() {
            return Ok(());
        }

        Err(Error::NotFound(id.to_string()))
    }

    /// Write a line to a running backend's stdin
    pub fn send_input(&self, id: &str, line: &str) -> Result<()> {
        let state = self.shared.state.lock();
        match state.active.get(id) {
            Some(slot) => {
                if line.contains(['\n', '\r']) {
                    return Err(Error::Rejected(Rejection::invalid(
                        slot.tx.role(),
                        "input must be a single line",
                    )));
                }
                slot.control
                    .send(Control::Input(line.to_string()))
                    .map_err(|_| Error::NotRunning { id: id.to_string() })
            }
            None if state.find(id).is_some() => Err(Error::NotRunning { id: id.to_string() }),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// Listed transactions in commit order
    pub fn list(&self) -> Vec<TransactionInfo> {
        let state = self.shared.state.lock();
        state.entries.iter().map(|t| t.info()).collect()
    }

    /// Outcome and results of a listed transaction
    pub fn get_result(&self, id: &str) -> Result<TransactionResult> {
        let tx = self
            .transaction(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(match tx.outcome() {
            Some(outcome) => TransactionResult::Finished {
                outcome,
                results: tx.results(),
            },
            None => TransactionResult::Pending(tx.state()),
        })
    }

    /// Queue-level events from now on
    pub fn watch(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let waiting = self.shared.state.lock().waiting.len() as u64;
        let m = &self.shared.metrics;
        MetricsSnapshot {
            submitted: m.submitted.load(Ordering::Relaxed),
            rejected: m.rejected.load(Ordering::Relaxed),
            running: m.running.load(Ordering::Relaxed),
            waiting,
            succeeded: m.succeeded.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            cancelled: m.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, cancel waiters and stop running backends
    ///
    /// Running backends get SIGTERM (then SIGKILL after the kill grace).
    /// Backends still alive after `grace` are killed by dropping them.
    pub async fn shutdown(&self, grace: Duration) {
        let (waiters, tasks) = {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            let waiters: Vec<Waiter> = state.waiting.drain(..).collect();
            let mut tasks = Vec::new();
            for slot in state.active.values_mut() {
                let _ = slot.control.send(Control::Shutdown);
                if let Some(task) = slot.task.take() {
                    tasks.push(task);
                }
            }
            (waiters, tasks)
        };

        info!(
            "Shutting down: {} waiting, {} running",
            waiters.len(),
            tasks.len()
        );

        for waiter in waiters {
            if waiter.tx.finish(Outcome::Cancelled) {
                self.shared.metrics.record_outcome(&Outcome::Cancelled);
                self.emit(QueueEvent::Finished {
                    id: waiter.tx.id().to_string(),
                    outcome: Outcome::Cancelled,
                });
            }
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, all).await.is_err() {
            warn!("Backends still running after {:?}, killing", grace);
            for abort in aborts {
                abort.abort();
            }
            let state = self.shared.state.lock();
            for slot in state.active.values() {
                slot.tx.finish(Outcome::Cancelled);
            }
        }
    }
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TransactionQueue")
            .field("listed", &state.entries.len())
            .field("waiting", &state.waiting.len())
            .field("active", &state.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::auth::ReadOnly;
    use crate::role::{Filter, FilterSet, PackageId};

    fn registry() -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry
            .register(
                BackendDescriptor::new("sleepy", "/bin/sleep")
                    .with_roles([Role::SearchName, Role::RefreshCache, Role::RemovePackages])
                    .with_filters(FilterSet::empty().with(Filter::Installed)),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_rejections() {
        let queue = TransactionQueue::new(registry(), DaemonConfig::default()).unwrap();

        let err = queue.commit(Role::UpgradeSystem, Params::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected(Rejection::UnsupportedRole(Role::UpgradeSystem))
        ));

        let err = queue.commit(Role::SearchName, Params::new()).unwrap_err();
        assert!(matches!(err, Error::Rejected(Rejection::InvalidParams { .. })));

        let params = Params::new()
            .with_values(["foo"])
            .with_filters(FilterSet::empty().with(Filter::Gui));
        let err = queue.commit(Role::SearchName, params).unwrap_err();
        assert!(matches!(err, Error::Rejected(Rejection::UnsupportedFilter { .. })));

        queue.set_privilege_check(ReadOnly);
        let id = PackageId::parse("foo;1.0;x86_64;repo").unwrap();
        let err = queue
            .commit(Role::RemovePackages, Params::new().with_package_ids([id]))
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(Rejection::NotAuthorized { .. })));

        assert_eq!(queue.metrics().rejected, 4);
        assert!(queue.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let queue = TransactionQueue::new(registry(), DaemonConfig::default()).unwrap();
        assert!(matches!(queue.cancel("nope"), Err(Error::NotFound(_))));
        assert!(matches!(queue.subscribe("nope"), Err(Error::NotFound(_))));
        assert!(matches!(queue.get_result("nope"), Err(Error::NotFound(_))));
        assert!(matches!(queue.send_input("nope", "y"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_submit_twice_rejected() {
        let queue = TransactionQueue::new(
            registry(),
            DaemonConfig::default().with_max_active(1).with_max_waiting(4),
        )
        .unwrap();
        let tx = Arc::new(Transaction::new(Role::RefreshCache, Params::new()));
        queue.submit(Arc::clone(&tx)).unwrap();
        let err = queue.submit(tx).unwrap_err();
        assert!(matches!(err, Error::Rejected(Rejection::AlreadySubmitted(_))));
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_reject_policy_when_busy() {
        let queue = TransactionQueue::new(
            registry(),
            DaemonConfig::default()
                .with_max_active(1)
                .with_wait_policy(WaitPolicy::Reject)
                .with_kill_grace(Duration::from_millis(100)),
        )
        .unwrap();
        // `sleep refresh-cache false` exits with an error quickly, but not
        // before the second request is admitted
        queue.commit(Role::RefreshCache, Params::new()).unwrap();
        let err = queue.commit(Role::RefreshCache, Params::new()).unwrap_err();
        assert!(matches!(err, Error::Rejected(Rejection::QueueFull { waiting: 0 })));
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_cancel_waiting_is_synchronous() {
        let queue = TransactionQueue::new(
            registry(),
            DaemonConfig::default()
                .with_max_active(1)
                .with_kill_grace(Duration::from_millis(100)),
        )
        .unwrap();
        let first = queue.commit(Role::RefreshCache, Params::new()).unwrap();
        let second = queue.commit(Role::RefreshCache, Params::new()).unwrap();

        assert_eq!(queue.metrics().waiting, 1);
        queue.cancel(&second).unwrap();
        assert_eq!(
            queue.get_result(&second).unwrap(),
            TransactionResult::Finished {
                outcome: Outcome::Cancelled,
                results: TransactionResults::default(),
            }
        );
        // still listed during retention
        assert_eq!(queue.list().len(), 2);
        // cancelling again is a no-op
        queue.cancel(&second).unwrap();

        queue.cancel(&first).unwrap();
        queue.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let queue = TransactionQueue::new(registry(), DaemonConfig::default()).unwrap();
        queue.shutdown(Duration::from_secs(1)).await;
        let err = queue.commit(Role::RefreshCache, Params::new()).unwrap_err();
        assert!(matches!(err, Error::Rejected(Rejection::ShuttingDown)));
    }
}
