//! Crate-wide internal error taxonomy.
//!
//! These are distinct from [`crate::envelope::ErrorKind`], the wire-level
//! classification carried in an [`crate::envelope::AlgorithmResponse`].
//! Internal errors are mapped onto an `ErrorKind` at the boundary where a
//! request finally produces a response (see `crate::executor`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("algorithm already registered: {name} ({version})")]
    AlreadyRegistered { name: String, version: String },

    #[error("algorithm not found: {name} ({version})")]
    NotFound { name: String, version: String },

    #[error("invalid entrypoint for {name} ({version}): {reason}")]
    InvalidEntrypoint {
        name: String,
        version: String,
        reason: String,
    },

    #[error("invalid algorithm spec for {name} ({version}): {reason}")]
    InvalidSpec {
        name: String,
        version: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("service is already in state {state:?}")]
    AlreadyInState { state: crate::runtime::ServiceState },

    #[error("invalid transition from {from:?} to {to:?}, allowed: {allowed:?}")]
    InvalidTransition {
        from: crate::runtime::ServiceState,
        to: crate::runtime::ServiceState,
        allowed: Vec<crate::runtime::ServiceState>,
    },

    #[error("lifecycle hook failed during transition to {to:?}: {source}")]
    HookFailed {
        to: crate::runtime::ServiceState,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum RegistryClientError {
    #[error("registry client transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry client decode error: {0}")]
    Decode(String),

    #[error("registry responded with status {status}: {body}")]
    Status { status: u16, body: String },
}
