//! # Errors
//!
//! Every failure the retrieval core can produce is a variant of [`RagError`].
//! Index and store errors travel up to the orchestration layer as typed values
//! and abort only the request that hit them. The service boundary turns them
//! into `{"error": ...}` payloads (see [`crate::service`]), so none of these
//! ever escape as a process failure once a request is being served.

use thiserror::Error;

/// Errors raised by the retrieval core, the generation backends and the
/// ambient plumbing around them.
#[derive(Error, Debug)]
pub enum RagError {
    /// No documents, no query text, or an empty vector batch.
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// An index operation was attempted before any successful build.
    #[error("Index not built: {0}")]
    NotBuilt(String),

    /// A query named a user that has no persisted record.
    #[error("No documents found for user {0}")]
    NotFound(String),

    /// The persisted index/documents pair disagrees with itself.
    #[error("Corrupt index record for user {user_id}: {reason}")]
    Corruption { user_id: String, reason: String },

    /// The caller asked for a model no configured provider serves.
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Network failure, timeout or non-2xx status from a backend.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend answered, but not with the shape we expected.
    #[error("Malformed response from backend: {0}")]
    MalformedResponse(String),

    /// Vector width does not match the index dimension.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Caller input that is present but not acceptable (e.g. untyped documents).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Fatal startup misconfiguration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding model failed to load or to run.
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    /// Stable snake-case tag for logs and payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::EmptyInput(_) => "empty_input",
            RagError::NotBuilt(_) => "not_built",
            RagError::NotFound(_) => "not_found",
            RagError::Corruption { .. } => "corruption",
            RagError::UnsupportedProvider(_) => "unsupported_provider",
            RagError::BackendUnavailable(_) => "backend_unavailable",
            RagError::MalformedResponse(_) => "malformed_response",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::InvalidInput(_) => "invalid_input",
            RagError::Config(_) => "config",
            RagError::Embedding(_) => "embedding",
            RagError::Io(_) => "io",
            RagError::Json(_) | RagError::Yaml(_) | RagError::Serialization(_) => "serialization",
        }
    }

    /// HTTP status used when this error is returned by the server.
    pub fn status_code(&self) -> u16 {
        match self {
            RagError::NotFound(_) => 404,
            RagError::EmptyInput(_)
            | RagError::InvalidInput(_)
            | RagError::UnsupportedProvider(_)
            | RagError::DimensionMismatch { .. } => 400,
            RagError::BackendUnavailable(_) | RagError::MalformedResponse(_) => 502,
            _ => 500,
        }
    }

    pub(crate) fn corruption(user_id: &str, reason: impl Into<String>) -> Self {
        RagError::Corruption {
            user_id: user_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RagError::MalformedResponse(err.to_string())
        } else {
            RagError::BackendUnavailable(err.to_string())
        }
    }
}

impl From<bincode::error::EncodeError> for RagError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RagError::Serialization(err.to_string())
    }
}
