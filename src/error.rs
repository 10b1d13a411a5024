// src/error.rs

//! Error types for the transaction engine
//!
//! Synchronous failures (bad requests, unknown transactions, I/O while
//! spawning) are reported through [`Error`]. Failures that happen while a
//! backend is running are not errors of this kind: they become the
//! transaction's [`Outcome`](crate::transaction::Outcome).

use crate::role::Role;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration is structurally valid but semantically wrong
    #[error("Configuration error: {0}")]
    Config(String),

    /// The queue refused the transaction
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] Rejection),

    /// No transaction with this id is known
    #[error("Transaction not found: {0}")]
    NotFound(String),

    /// The backend executable could not be started
    #[error("Failed to spawn backend '{backend}': {reason}")]
    Spawn { backend: String, reason: String },

    /// A backend output line exceeded the line length limit and was dropped
    #[error("Backend '{backend}' sent a {length} byte line, over the limit")]
    LineTooLong { backend: String, length: usize },

    /// The transaction is not in a state that accepts the request
    #[error("Transaction {id} is not running")]
    NotRunning { id: String },

    /// A blocking bridge call was made from inside an async runtime
    #[error("Synchronous transaction call made from inside an async runtime")]
    NestedBridge,

    /// The engine has no runtime to schedule transactions on
    #[error("No async runtime available: {0}")]
    Runtime(String),

    /// Another daemon instance holds the lock
    #[error("Another daemon instance is already running (lock: {0})")]
    AlreadyRunning(String),
}

/// Reasons a transaction is refused before any backend is spawned
///
/// Rejections are always reported synchronously to the submitter and are
/// never retried by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No registered backend implements this role
    #[error("no backend supports role '{0}'")]
    UnsupportedRole(Role),

    /// The requested backend does not exist
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// The backend supporting the role does not declare this filter
    #[error("backend '{backend}' does not support filter '{filter}'")]
    UnsupportedFilter { backend: String, filter: String },

    /// Parameters do not match the role's contract
    #[error("invalid parameters for '{role}': {reason}")]
    InvalidParams { role: Role, reason: String },

    /// The privilege check refused the request
    #[error("not authorized to run '{role}': {reason}")]
    NotAuthorized { role: Role, reason: String },

    /// No slot is free and the queue may not (or can no longer) hold waiters
    #[error("queue is full ({waiting} waiting)")]
    QueueFull { waiting: usize },

    /// The engine is shutting down
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The transaction was already submitted once
    #[error("transaction {0} was already submitted")]
    AlreadySubmitted(String),
}

impl Rejection {
    /// Shorthand for a parameter contract violation
    pub fn invalid(role: Role, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            role,
            reason: reason.into(),
        }
    }
}
