// src/backend/mod.rs

//! Backends: external helper processes that perform package operations
//!
//! The engine knows a backend only through its [`BackendDescriptor`]: how to
//! start it, which roles and filters it declared, and how many of its
//! operations may run at once. Which backend runs a role is a capability
//! lookup in the [`BackendRegistry`], never a hardcoded identity.
//!
//! # Module Structure
//!
//! - `codec` - stdout line protocol and argv encoding
//! - `spawn` - one supervised child process per transaction

pub mod codec;
pub mod spawn;

pub use codec::{
    BackendEvent, DecodeError, FinishedStatus, PackageInfo, RestartKind, Status, decode_line,
    encode_command, encode_event,
};
pub use spawn::{BackendOutput, BackendProcess, ExitOutcome, MAX_LINE_LENGTH};

use crate::error::{Error, Rejection, Result};
use crate::role::{FilterSet, Params, Role};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Static description of an installed backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    /// Unique name (e.g. "dnf", "apt")
    pub name: String,
    /// Executable to spawn
    pub command: PathBuf,
    /// Arguments placed before the role name (e.g. a helper script)
    pub args: Vec<String>,
    /// Roles this backend implements
    pub roles: BTreeSet<Role>,
    /// Filters this backend honours
    pub filters: FilterSet,
    /// How many transactions may run on this backend at once (`None` = only
    /// the global ceiling applies)
    pub max_concurrent: Option<usize>,
    /// Whether the backend may be interrupted until it says otherwise
    pub cancellable: bool,
    /// Extra environment for the backend process
    pub env: BTreeMap<String, String>,
    /// Overrides the daemon-wide inactivity timeout
    pub inactivity_timeout: Option<Duration>,
}

impl BackendDescriptor {
    /// Create a descriptor for a non-reentrant, cancellable backend with no
    /// roles yet
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            roles: BTreeSet::new(),
            filters: FilterSet::empty(),
            max_concurrent: Some(1),
            cancellable: true,
            env: BTreeMap::new(),
            inactivity_timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I: IntoIterator<Item = Role>>(mut self, roles: I) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    /// A reentrant backend is only bounded by the global ceiling
    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.max_concurrent = if reentrant { None } else { Some(1) };
        self
    }

    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit.max(1));
        self
    }

    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    /// Whether this backend implements the role
    pub fn supports(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// All backends known to the daemon, in registration order
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<BackendDescriptor>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend
    ///
    /// Names must be unique and the command must not be empty.
    pub fn register(&mut self, descriptor: BackendDescriptor) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(Error::Config("backend name must not be empty".to_string()));
        }
        if descriptor.command.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "backend '{}' has no command",
                descriptor.name
            )));
        }
        if self.get(&descriptor.name).is_some() {
            return Err(Error::Config(format!(
                "backend '{}' is registered twice",
                descriptor.name
            )));
        }

        debug!(
            "Registered backend {} ({} roles, limit {:?})",
            descriptor.name,
            descriptor.roles.len(),
            descriptor.max_concurrent
        );
        self.backends.push(Arc::new(descriptor));
        Ok(())
    }

    /// Look up a backend by name
    pub fn get(&self, name: &str) -> Option<Arc<BackendDescriptor>> {
        self.backends.iter().find(|b| b.name == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendDescriptor>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Whether any backend implements the role
    pub fn any_supports(&self, role: Role) -> bool {
        self.backends.iter().any(|b| b.supports(role))
    }

    /// Pick the backend that will run a request
    ///
    /// An explicit backend in `params` must support the role and filters
    /// itself. Otherwise the first registered backend supporting the role and
    /// every requested filter wins.
    pub fn select(&self, role: Role, params: &Params) -> std::result::Result<Arc<BackendDescriptor>, Rejection> {
        let candidates: Vec<&Arc<BackendDescriptor>> = match params.backend {
            Some(ref name) => {
                let backend = self
                    .backends
                    .iter()
                    .find(|b| &b.name == name)
                    .ok_or_else(|| Rejection::UnknownBackend(name.clone()))?;
                vec![backend]
            }
            None => self.backends.iter().collect(),
        };

        let capable: Vec<&Arc<BackendDescriptor>> =
            candidates.into_iter().filter(|b| b.supports(role)).collect();
        let first = capable.first().ok_or(Rejection::UnsupportedRole(role))?;

        if let Some(backend) = capable
            .iter()
            .find(|b| b.filters.is_superset(&params.filters))
        {
            return Ok(Arc::clone(backend));
        }

        let missing = params
            .filters
            .missing_from(&first.filters)
            .first()
            .map(|f| f.to_string())
            .unwrap_or_default();
        Err(Rejection::UnsupportedFilter {
            backend: first.name.clone(),
            filter: missing,
        })
    }
}
