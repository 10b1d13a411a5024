// src/daemon/config.rs
//! Configuration file parsing for pkgd
//!
//! Supports TOML configuration files with the following sections:
//! - [daemon] - Concurrency ceilings, timeouts, retention, lock path
//! - [[backend]] - One entry per installed backend

use super::{DaemonConfig, WaitPolicy};
use crate::backend::{BackendDescriptor, BackendRegistry};
use crate::error::{Error, Result};
use crate::role::{FilterSet, Role};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pkgd/pkgd.toml";

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PkgdConfig {
    /// Engine settings
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Registered backends, in selection order
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendSection>,
}

/// Engine configuration section
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    #[serde(default = "default_max_active")]
    pub max_active: usize,

    #[serde(default = "default_max_waiting")]
    pub max_waiting: usize,

    #[serde(default)]
    pub wait_policy: WaitPolicy,

    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_max_malformed_lines")]
    pub max_malformed_lines: usize,

    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            max_waiting: default_max_waiting(),
            wait_policy: WaitPolicy::default(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            kill_grace_secs: default_kill_grace(),
            retention_secs: default_retention(),
            max_malformed_lines: default_max_malformed_lines(),
            lock_path: default_lock_path(),
        }
    }
}

fn default_max_active() -> usize {
    4
}

fn default_max_waiting() -> usize {
    64
}

fn default_inactivity_timeout() -> u64 {
    300
}

fn default_kill_grace() -> u64 {
    5
}

fn default_retention() -> u64 {
    5
}

fn default_max_malformed_lines() -> usize {
    64
}

fn default_lock_path() -> PathBuf {
    PathBuf::from(super::DaemonLock::DEFAULT_PATH)
}

fn default_true() -> bool {
    true
}

/// One `[[backend]]` entry
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    pub name: String,

    /// Executable to spawn
    pub command: PathBuf,

    /// Arguments placed before the role name
    #[serde(default)]
    pub args: Vec<String>,

    pub roles: Vec<Role>,

    #[serde(default)]
    pub filters: FilterSet,

    /// `false` limits the backend to one transaction at a time
    #[serde(default)]
    pub reentrant: bool,

    /// Explicit concurrency ceiling, overrides `reentrant`
    pub max_concurrent: Option<usize>,

    #[serde(default = "default_true")]
    pub cancellable: bool,

    pub inactivity_timeout_secs: Option<u64>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl BackendSection {
    fn to_descriptor(&self) -> BackendDescriptor {
        let mut descriptor = BackendDescriptor::new(&self.name, &self.command)
            .with_args(self.args.iter().cloned())
            .with_roles(self.roles.iter().copied())
            .with_filters(self.filters)
            .reentrant(self.reentrant)
            .with_cancellable(self.cancellable);
        if let Some(limit) = self.max_concurrent {
            descriptor = descriptor.with_max_concurrent(limit);
        }
        if let Some(secs) = self.inactivity_timeout_secs {
            descriptor = descriptor.with_inactivity_timeout(Duration::from_secs(secs));
        }
        descriptor.env = self.env.clone();
        descriptor
    }
}

impl PkgdConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        debug!(
            "Loaded {} with {} backends",
            path.display(),
            config.backends.len()
        );
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: PkgdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.max_active == 0 {
            return Err(Error::Config("daemon.max_active must be at least 1".to_string()));
        }
        if self.daemon.inactivity_timeout_secs == 0 {
            return Err(Error::Config(
                "daemon.inactivity_timeout_secs must be at least 1".to_string(),
            ));
        }
        for backend in &self.backends {
            if backend.roles.is_empty() {
                return Err(Error::Config(format!(
                    "backend '{}' declares no roles",
                    backend.name
                )));
            }
            if backend.max_concurrent == Some(0) {
                return Err(Error::Config(format!(
                    "backend '{}': max_concurrent must be at least 1",
                    backend.name
                )));
            }
        }
        Ok(())
    }

    /// Engine settings as a [`DaemonConfig`]
    pub fn to_daemon_config(&self) -> DaemonConfig {
        let d = &self.daemon;
        DaemonConfig::default()
            .with_max_active(d.max_active)
            .with_max_waiting(d.max_waiting)
            .with_wait_policy(d.wait_policy)
            .with_inactivity_timeout(Duration::from_secs(d.inactivity_timeout_secs))
            .with_kill_grace(Duration::from_secs(d.kill_grace_secs))
            .with_retention(Duration::from_secs(d.retention_secs))
            .with_max_malformed_lines(d.max_malformed_lines)
            .with_lock_path(&d.lock_path)
    }

    /// Build the backend registry, in file order
    pub fn to_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        for backend in &self.backends {
            registry.register(backend.to_descriptor())?;
        }
        Ok(registry)
    }
}
