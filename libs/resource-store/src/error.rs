//! Error types for resource store operations.

use thiserror::Error;

use crate::ObjectKey;

/// Error type for every [`ResourceStore`] operation.
///
/// [`ResourceStore`]: crate::ResourceStore
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No object with this identity exists.
    #[error("{0} not found")]
    NotFound(ObjectKey),

    /// An object with this identity already exists.
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    /// The update was computed from a stale copy of the object.
    #[error("conflict updating {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    /// The object is malformed (missing name, namespace, etc).
    #[error("invalid object: {0}")]
    Invalid(String),

    /// The store could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// A subscriber fell behind and missed notifications, it should resync by listing.
    #[error("subscriber lagged, {0} notifications dropped")]
    Lagged(u64),
}

impl StoreError {
    /// Returns true if the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::Transport(_) | StoreError::Lagged(_)
        )
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
