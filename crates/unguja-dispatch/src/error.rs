//! The dispatch error surface.

use thiserror::Error;
use unguja_core::CoreError;
use unguja_storage::StorageError;

/// Errors surfaced by the dispatch engine.
///
/// Clone is required so single-flight followers receive the leader's
/// error verbatim.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Unknown namespace or relation, malformed reference, or an otherwise
    /// unusable argument.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The schema is inconsistent with the request.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    /// The request deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,

    /// Recursion reached the configured maximum depth.
    #[error("the dispatch depth limit was exhausted")]
    ExhaustedDepth,

    /// The datastore is transiently unreachable or read-only.
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    /// Invariant violation inside the engine.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DispatchError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        DispatchError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        DispatchError::Internal {
            message: message.into(),
        }
    }
}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable { reason } => DispatchError::Unavailable { reason },
            StorageError::ReadOnly => DispatchError::Unavailable {
                reason: "datastore is read-only".to_string(),
            },
            StorageError::WatchLagged { .. } => DispatchError::Unavailable {
                reason: err.to_string(),
            },
            StorageError::StaleRevision { .. } | StorageError::InvalidRevision { .. } => {
                DispatchError::InvalidArgument {
                    message: err.to_string(),
                }
            }
            StorageError::NamespaceNotFound { .. } | StorageError::CaveatNotFound { .. } => {
                DispatchError::InvalidArgument {
                    message: err.to_string(),
                }
            }
            StorageError::ConflictingWrite { .. } | StorageError::InadmissibleWrite { .. } => {
                DispatchError::FailedPrecondition {
                    message: err.to_string(),
                }
            }
            StorageError::InvalidFilter { .. } => DispatchError::Internal {
                message: err.to_string(),
            },
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NamespaceNotFound { .. }
            | CoreError::RelationNotFound { .. }
            | CoreError::InvalidObjectReference { .. }
            | CoreError::InvalidIdentifier { .. }
            | CoreError::InvalidRevision { .. } => DispatchError::InvalidArgument {
                message: err.to_string(),
            },
            CoreError::SchemaValidation { .. } | CoreError::CaveatParameterType { .. } => {
                DispatchError::FailedPrecondition {
                    message: err.to_string(),
                }
            }
            CoreError::CaveatNotFound { .. }
            | CoreError::CaveatCompilation { .. }
            | CoreError::CaveatEvaluation { .. } => DispatchError::Internal {
                message: err.to_string(),
            },
        }
    }
}

/// Result alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
