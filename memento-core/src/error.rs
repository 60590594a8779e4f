/*!
Error types for the memento persistence engine.
*/

use std::time::Duration;

use memento_retry::Retryable;
use thiserror::Error;

use crate::memento::MementoKind;
use crate::rebind::RebindReport;

/// Result type used throughout the memento core.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors that can occur while persisting or rebinding mementos.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Malformed or incompatible record
    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    /// Backend write or read failed, or the persister refuses writes after an earlier failure
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Rebind found ids with no corresponding memento
    #[error("Unresolved references: {0}")]
    UnresolvedReference(RebindReport),

    /// Waiting for outstanding writes exceeded the budget
    #[error("Timed out after {waited:?} with {pending} write(s) outstanding")]
    Timeout { pending: u64, waited: Duration },

    /// A memento did not survive an encode/decode cycle unchanged
    #[error("{kind} '{id}' is not serializable: {reason}")]
    NotSerializable {
        kind: MementoKind,
        id: String,
        reason: String,
    },

    /// Invariant violation or misuse of a single-use object
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl PersistError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new persistence failure
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::PersistenceFailure(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new not-serializable error for the given memento
    pub fn not_serializable<S1, S2>(kind: MementoKind, id: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::NotSerializable {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only backend-level failures qualify. Encoding, integrity and rebind
    /// errors are deterministic and will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::PersistenceFailure(_) | Self::Timeout { .. }
        )
    }
}

impl Retryable for PersistError {
    fn is_transient(&self) -> bool {
        PersistError::is_transient(self)
    }
}
