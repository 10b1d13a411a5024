// src/daemon/auth.rs

//! Authorization of transaction requests
//!
//! The queue asks a [`PrivilegeCheck`] before committing a transaction. How
//! the caller is identified (peer credentials, PolicyKit, a token) is up to
//! the embedding front end; the engine only needs a yes or a reason for no.
//!
//! Provided checks:
//! - [`AllowAll`]: every request passes (default)
//! - [`ReadOnly`]: queries pass, anything that changes the system is refused

use crate::role::{Params, Role};

/// Decides whether a request may run
pub trait PrivilegeCheck: Send + Sync {
    /// `Err(reason)` refuses the request
    fn check(&self, role: Role, params: &Params) -> Result<(), String>;
}

/// Permits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PrivilegeCheck for AllowAll {
    fn check(&self, _role: Role, _params: &Params) -> Result<(), String> {
        Ok(())
    }
}

/// Permits only roles that do not modify the system
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

impl PrivilegeCheck for ReadOnly {
    fn check(&self, role: Role, _params: &Params) -> Result<(), String> {
        if role.is_modifying() {
            return Err(format!("'{}' modifies the system and this daemon is read-only", role));
        }
        Ok(())
    }
}

impl<F> PrivilegeCheck for F
where
    F: Fn(Role, &Params) -> Result<(), String> + Send + Sync,
{
    fn check(&self, role: Role, params: &Params) -> Result<(), String> {
        self(role, params)
    }
}
