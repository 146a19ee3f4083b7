//! Error types for the schema model and evaluators.

use thiserror::Error;

/// Errors produced while building or querying the core model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A reference string could not be parsed into an object.
    #[error("invalid object reference: {value}")]
    InvalidObjectReference { value: String },

    /// An identifier does not match the allowed pattern.
    #[error("invalid identifier '{value}' for {field}")]
    InvalidIdentifier { field: &'static str, value: String },

    /// Namespace not present in the compiled schema.
    #[error("namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// Relation not present on the namespace.
    #[error("relation '{relation}' not found on namespace '{namespace}'")]
    RelationNotFound {
        namespace: String,
        relation: String,
    },

    /// Caveat not present in the compiled schema.
    #[error("caveat not found: {caveat}")]
    CaveatNotFound { caveat: String },

    /// Schema failed validation.
    #[error("schema validation failed: {message}")]
    SchemaValidation { message: String },

    /// A caveat expression could not be compiled.
    #[error("failed to compile caveat '{caveat}': {message}")]
    CaveatCompilation { caveat: String, message: String },

    /// A caveat expression produced a non-boolean result or could not be
    /// executed for a structural reason.
    #[error("caveat '{caveat}' evaluation failed: {message}")]
    CaveatEvaluation { caveat: String, message: String },

    /// A caveat parameter was bound to a value of the wrong type.
    #[error("caveat '{caveat}' parameter '{parameter}' expects {expected}")]
    CaveatParameterType {
        caveat: String,
        parameter: String,
        expected: &'static str,
    },

    /// A revision string could not be parsed.
    #[error("invalid revision: {value}")]
    InvalidRevision { value: String },
}

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
