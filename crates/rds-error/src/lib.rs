//! rds-error
//!
//! Closed error taxonomy for the reactive data store core (spec §4.2).
//!
//! Every fallible operation in the core returns `Result<T, StoreError>` (or a
//! type alias over it). There is deliberately no `From<anyhow::Error>` impl:
//! library crates keep `thiserror`'s closed-enum discipline; human-readable
//! wrapping with `anyhow::Context` is left to the binary at the edge
//! (`rds-cli`), keeping `anyhow` out of pure-logic crates (`mqk-reconcile`,
//! `mqk-integrity`) and reserved for app wiring instead.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Field-level validation failure, carried by [`StoreError::Validation`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The closed set of failure kinds named in spec §4.2.
///
/// `retryable()` reflects the set called out there: `Network, Timeout, Sync,
/// PoolTimeout, QuotaExceeded, CircuitOpen`. Everything else is terminal —
/// surfaced to the caller or fatal to the store, never silently retried.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("validation failed: {}", violations.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Validation { violations: Vec<Violation> },

    #[error("conflict detected")]
    Conflict,

    #[error("sync error: {message}")]
    Sync { message: String },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("not authorized: {message}")]
    Authorization { message: String },

    #[error("transaction failed: {message}")]
    Transaction { message: String },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("circuit is open")]
    CircuitOpen,

    #[error("pool acquire timed out after {waited_ms}ms")]
    PoolTimeout { waited_ms: u64 },

    #[error("pool is closed")]
    PoolClosed,

    #[error("pool is not initialized")]
    PoolNotInit,

    #[error("schema validation failed on field `{field}`: expected {expected}, got {actual}")]
    SchemaValidation {
        field: String,
        expected: String,
        actual: String,
    },
}

impl StoreError {
    /// Human message, independent of `Display`'s debug-oriented cause chain.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether the operation that produced this error is safe to retry
    /// automatically. Mirrors spec §4.2's named retryable set exactly.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Network { .. }
                | StoreError::Timeout { .. }
                | StoreError::Sync { .. }
                | StoreError::PoolTimeout { .. }
                | StoreError::QuotaExceeded { .. }
                | StoreError::CircuitOpen
        )
    }

    /// Fatal errors render the store unusable (spec §7): all streams should
    /// close and `close()` must be called.
    pub fn fatal(&self) -> bool {
        matches!(self, StoreError::PoolClosed | StoreError::IllegalState { .. })
    }

    pub fn network(message: impl Into<String>) -> Self {
        StoreError::Network {
            message: message.into(),
            cause: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        StoreError::Timeout {
            message: message.into(),
        }
    }

    pub fn validation(violations: Vec<Violation>) -> Self {
        StoreError::Validation { violations }
    }

    pub fn sync(message: impl Into<String>) -> Self {
        StoreError::Sync {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        StoreError::IllegalState {
            message: message.into(),
        }
    }
}

/// Convenience alias used across every crate in the workspace.
pub type StoreResult<T> = Result<T, StoreError>;

/// Tagless classification of a `StoreError`, used where a value needs to be
/// `Clone`/`PartialEq`/snapshot-friendly — e.g. `PendingChange::last_error`
/// (spec §3) — but carrying the full error (with its boxed `source`) would
/// make that type unshareable across a reactive snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorKind {
    NotFound,
    Network,
    Timeout,
    Validation,
    Conflict,
    Sync,
    Auth,
    Authorization,
    Transaction,
    IllegalState,
    Cancelled,
    QuotaExceeded,
    CircuitOpen,
    PoolTimeout,
    PoolClosed,
    PoolNotInit,
    SchemaValidation,
}

impl From<&StoreError> for ErrorKind {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::Network { .. } => ErrorKind::Network,
            StoreError::Timeout { .. } => ErrorKind::Timeout,
            StoreError::Validation { .. } => ErrorKind::Validation,
            StoreError::Conflict => ErrorKind::Conflict,
            StoreError::Sync { .. } => ErrorKind::Sync,
            StoreError::Auth { .. } => ErrorKind::Auth,
            StoreError::Authorization { .. } => ErrorKind::Authorization,
            StoreError::Transaction { .. } => ErrorKind::Transaction,
            StoreError::IllegalState { .. } => ErrorKind::IllegalState,
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            StoreError::CircuitOpen => ErrorKind::CircuitOpen,
            StoreError::PoolTimeout { .. } => ErrorKind::PoolTimeout,
            StoreError::PoolClosed => ErrorKind::PoolClosed,
            StoreError::PoolNotInit => ErrorKind::PoolNotInit,
            StoreError::SchemaValidation { .. } => ErrorKind::SchemaValidation,
        }
    }
}

/// Observability seam named in spec §7: "every error flows to an optional
/// sink (used by telemetry and audit)". Default is a no-op; hosts wire their
/// own (e.g. forwarding into `tracing` or an external collector).
pub trait ErrorSink: Send + Sync {
    fn observe(&self, error: &StoreError);
}

/// The default sink: logs at `warn` via `tracing` and drops it.
#[derive(Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn observe(&self, error: &StoreError) {
        tracing::warn!(error = %error, retryable = error.retryable(), "store error observed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_matches_spec() {
        assert!(StoreError::network("x").retryable());
        assert!(StoreError::timeout("x").retryable());
        assert!(StoreError::sync("x").retryable());
        assert!(StoreError::PoolTimeout { waited_ms: 1 }.retryable());
        assert!(StoreError::QuotaExceeded { message: "x".into() }.retryable());
        assert!(StoreError::CircuitOpen.retryable());

        assert!(!StoreError::NotFound.retryable());
        assert!(!StoreError::Conflict.retryable());
        assert!(!StoreError::validation(vec![]).retryable());
        assert!(!StoreError::PoolClosed.retryable());
    }

    #[test]
    fn fatal_set_matches_spec() {
        assert!(StoreError::PoolClosed.fatal());
        assert!(StoreError::illegal_state("x").fatal());
        assert!(!StoreError::NotFound.fatal());
        assert!(!StoreError::CircuitOpen.fatal());
    }
}
