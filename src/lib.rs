// src/lib.rs

//! pkgd: package transaction engine
//!
//! One transaction model, one queue and one progress protocol in front of
//! whatever package managers are installed. Each package manager is a
//! backend: an external program that receives a role and its arguments on
//! the command line and reports progress as TAB-separated lines on stdout.
//!
//! # Architecture
//!
//! - Roles: a fixed vocabulary of operations (search, resolve, install, ...)
//! - Backends: declared in configuration, selected by capability
//! - Transactions: New -> Committed -> Running -> Finished, monotonic
//! - Queue: global and per-backend concurrency ceilings, FIFO per backend
//! - Sync bridge: blocking calls for callers without an async runtime

pub mod backend;
pub mod daemon;
mod error;
pub mod role;
pub mod sync;
pub mod transaction;

pub use backend::{BackendDescriptor, BackendEvent, BackendRegistry};
pub use daemon::{DaemonConfig, PkgdConfig, QueueEvent, TransactionQueue, TransactionResult};
pub use error::{Error, Rejection, Result};
pub use role::{Filter, FilterSet, Hints, PackageId, Params, Role, TransactionFlag, TransactionFlags};
pub use sync::SyncBridge;
pub use transaction::{
    ErrorKind, Outcome, Subscription, Transaction, TransactionError, TransactionEvent,
    TransactionId, TransactionResults, TransactionState,
};
