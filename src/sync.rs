// src/sync.rs

//! Blocking facade over the transaction queue
//!
//! For callers without an async runtime of their own (command line tools,
//! test harnesses, plugins). Each call commits one transaction, then blocks
//! the calling thread on a private current-thread runtime until the
//! transaction finishes. The engine itself keeps running on its own runtime.
//!
//! Calling the bridge from inside a tokio runtime would block that runtime's
//! worker, so it refuses with [`Error::NestedBridge`] instead.

use crate::daemon::TransactionQueue;
use crate::error::{Error, Result};
use crate::role::{FilterSet, PackageId, Params, Role, TransactionFlags};
use crate::transaction::{Outcome, Transaction, TransactionEvent, TransactionResults};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Synchronous access to a [`TransactionQueue`]
#[derive(Debug, Clone)]
pub struct SyncBridge {
    queue: TransactionQueue,
}

impl SyncBridge {
    pub fn new(queue: TransactionQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }

    /// Run one transaction to completion
    ///
    /// `progress` sees every event of the transaction, the final
    /// `Finished` included, on the calling thread.
    pub fn run<F>(&self, role: Role, params: Params, mut progress: F) -> Result<(Outcome, TransactionResults)>
    where
        F: FnMut(&TransactionEvent),
    {
        if Handle::try_current().is_ok() {
            return Err(Error::NestedBridge);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let tx = Arc::new(Transaction::new(role, params));
        let mut subscription = tx.subscribe();
        let id = self.queue.submit(Arc::clone(&tx))?;
        debug!("Waiting for transaction {} ({})", id, role);

        let outcome = runtime.block_on(async {
            while let Some(event) = subscription.recv().await {
                progress(&event);
                if let TransactionEvent::Finished(outcome) = event {
                    return Some(outcome);
                }
            }
            None
        });

        let outcome = outcome.ok_or_else(|| {
            Error::Runtime(format!("event stream of transaction {} ended early", id))
        })?;
        Ok((outcome, tx.results()))
    }

    /// Map package names to ids
    pub fn resolve<I, S>(&self, filters: FilterSet, names: I) -> Result<(Outcome, TransactionResults)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = Params::new().with_filters(filters).with_values(names);
        self.run(Role::Resolve, params, |_| {})
    }

    pub fn search_names<I, S>(&self, filters: FilterSet, terms: I) -> Result<(Outcome, TransactionResults)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = Params::new().with_filters(filters).with_values(terms);
        self.run(Role::SearchName, params, |_| {})
    }

    pub fn install_packages<I>(&self, flags: TransactionFlags, ids: I) -> Result<(Outcome, TransactionResults)>
    where
        I: IntoIterator<Item = PackageId>,
    {
        let params = Params::new().with_flags(flags).with_package_ids(ids);
        self.run(Role::InstallPackages, params, |_| {})
    }

    pub fn remove_packages<I>(
        &self,
        flags: TransactionFlags,
        ids: I,
        allow_deps: bool,
        autoremove: bool,
    ) -> Result<(Outcome, TransactionResults)>
    where
        I: IntoIterator<Item = PackageId>,
    {
        let params = Params::new()
            .with_flags(flags)
            .with_package_ids(ids)
            .with_allow_deps(allow_deps)
            .with_autoremove(autoremove);
        self.run(Role::RemovePackages, params, |_| {})
    }

    pub fn refresh_cache(&self, force: bool) -> Result<(Outcome, TransactionResults)> {
        self.run(Role::RefreshCache, Params::new().with_force(force), |_| {})
    }
}
