/// Error taxonomy for Retcon operations.
///
/// This module provides the error hierarchy described in the reconciliation
/// kernel's error-handling design: every fallible kernel operation returns
/// `Result<T, RetconError>`, and the variant tells the caller (and the
/// kernel's own retry loop) how to react.
use thiserror::Error;

/// The unified error type for Retcon operations.
///
/// All fallible operations in the reconciliation kernel return
/// `Result<T, RetconError>`. Each variant corresponds to one of the error
/// kinds in the error-handling design: configuration, store, data-source,
/// document, merge, and internal-host failures.
#[derive(Error, Debug)]
pub enum RetconError {
    /// Malformed or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A store operation failed. Carries whether the round should be
    /// retried or the request should fail outright.
    #[error("store error ({kind}): {message}")]
    Store {
        /// Whether the kernel's retry loop should attempt the round again.
        kind: StoreErrorKind,
        /// Human-readable detail.
        message: String,
    },

    /// A single `DataSource` call failed. Non-fatal to the round: the
    /// source is marked absent and the round proceeds.
    #[error("data source '{source}' unavailable for entity '{entity}': {reason}")]
    DataSource {
        /// The entity the source was being queried for.
        entity: String,
        /// The source that failed.
        source: String,
        /// The underlying reason, as reported by the adaptor.
        reason: String,
    },

    /// Malformed JSON, an unsupported array, or non-UTF-8 text. Fatal to
    /// the round for the offending source only; other sources proceed.
    #[error("malformed document: {0}")]
    Document(String),

    /// An invariant was violated inside a merge policy. Should be
    /// unreachable; surfaces as an internal bug if it occurs.
    #[error("merge policy violated an invariant: {0}")]
    Merge(String),

    /// An unexpected host-level failure (I/O, panic boundary, etc.).
    /// Always surfaced.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Distinguishes a retryable store failure from a permanent one.
///
/// Transient errors (e.g. a contended lock, a dropped connection) retry the
/// whole reconciliation round with exponential backoff up to a bounded
/// number of attempts. Permanent errors fail the request immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Retry the round; the store may succeed on a later attempt.
    Transient,
    /// Do not retry; the request has failed.
    Permanent,
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreErrorKind::Transient => write!(f, "transient"),
            StoreErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

impl RetconError {
    /// Build a transient store error.
    pub fn store_transient(message: impl Into<String>) -> Self {
        RetconError::Store {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Build a permanent store error.
    pub fn store_permanent(message: impl Into<String>) -> Self {
        RetconError::Store {
            kind: StoreErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// True if this error represents a transient store failure that the
    /// kernel's retry loop should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetconError::Store {
                kind: StoreErrorKind::Transient,
                ..
            }
        )
    }

    /// The process exit code this error should map to on the CLI, per the
    /// external-interface contract: 1 for configuration errors, 2 for
    /// everything else kernel-related.
    pub fn exit_code(&self) -> i32 {
        match self {
            RetconError::Config(_) => 1,
            _ => 2,
        }
    }
}

impl From<serde_json::Error> for RetconError {
    fn from(e: serde_json::Error) -> Self {
        RetconError::Document(e.to_string())
    }
}

/// Result type alias for Retcon operations.
pub type RetconResult<T> = Result<T, RetconError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_store_error_is_retryable() {
        let err = RetconError::store_transient("lock contended");
        assert!(err.is_retryable());
    }

    #[test]
    fn permanent_store_error_is_not_retryable() {
        let err = RetconError::store_permanent("unique constraint violated");
        assert!(!err.is_retryable());
    }

    #[test]
    fn config_error_exit_code_is_one() {
        assert_eq!(RetconError::Config("bad".into()).exit_code(), 1);
    }

    #[test]
    fn other_errors_exit_code_is_two() {
        assert_eq!(RetconError::Merge("unreachable".into()).exit_code(), 2);
        assert_eq!(
            RetconError::DataSource {
                entity: "customer".into(),
                source: "data".into(),
                reason: "timeout".into()
            }
            .exit_code(),
            2
        );
    }
}
