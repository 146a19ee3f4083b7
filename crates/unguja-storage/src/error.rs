//! Storage error types.

use thiserror::Error;
use unguja_core::{CoreError, Revision};

/// Errors surfaced by datastore implementations.
///
/// Clone is required so a single-flight producer can fan one failure out
/// to every joined waiter.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The datastore is transiently unreachable.
    #[error("datastore unavailable: {reason}")]
    Unavailable { reason: String },

    /// A write arrived while the datastore is serving reads only.
    #[error("datastore is read-only")]
    ReadOnly,

    /// The revision is known but outside the acceptable staleness window.
    #[error("revision {revision} is stale")]
    StaleRevision { revision: Revision },

    /// The revision was never issued by this datastore.
    #[error("revision {revision} is not valid for this datastore")]
    InvalidRevision { revision: Revision },

    /// A CREATE collided with an existing relationship.
    #[error("relationship already exists: {tuple}")]
    ConflictingWrite { tuple: String },

    /// A write was rejected by the schema.
    #[error("inadmissible write: {message}")]
    InadmissibleWrite { message: String },

    /// Namespace definition missing at the requested revision.
    #[error("namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// Caveat definition missing at the requested revision.
    #[error("caveat not found: {caveat}")]
    CaveatNotFound { caveat: String },

    /// A malformed relationship filter.
    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },

    /// The watch consumer fell too far behind and missed changes.
    #[error("watch disconnected: missed {missed} changes")]
    WatchLagged { missed: u64 },
}

impl From<CoreError> for StorageError {
    fn from(err: CoreError) -> Self {
        StorageError::InadmissibleWrite {
            message: err.to_string(),
        }
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
