//! Error types for the tidemark domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all tidemark operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Compaction errors ---
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Io(String),

    #[error("Corrupted record for scope {scope}: {reason}")]
    Corrupted { scope: String, reason: String },
}

/// Failures of a single compaction cycle.
///
/// `Config` and `ModelUnavailable` stop a cycle from starting at all; the
/// rest are invocation failures that leave the backlog in place for a retry.
#[derive(Debug, Clone, Error)]
pub enum CompactionError {
    #[error("invalid compaction configuration: {0}")]
    Config(String),

    #[error("model '{model}' is unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("summarization call failed: {0}")]
    Invocation(#[from] ProviderError),

    #[error("summarization call to '{model}' timed out after {timeout_secs}s")]
    Timeout { model: String, timeout_secs: u64 },

    #[error("summarization returned no content")]
    EmptyOutput,

    #[error("compaction worker aborted: {0}")]
    Aborted(String),

    #[error("worker output of {output_tokens} tokens reaches the reflection threshold of {limit}")]
    OversizedOutput { output_tokens: u64, limit: u64 },
}

impl CompactionError {
    /// Configuration errors are fatal to starting a cycle; everything else is
    /// an invocation failure that may be retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ModelUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn compaction_error_wraps_provider_error() {
        let err: CompactionError = ProviderError::Network("connection reset".into()).into();
        assert!(!err.is_config());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn model_unavailable_is_config_error() {
        let err = CompactionError::ModelUnavailable {
            model: "ghost/model".into(),
            reason: "no provider registered".into(),
        };
        assert!(err.is_config());
        assert!(Error::from(err).to_string().contains("ghost/model"));
    }
}
