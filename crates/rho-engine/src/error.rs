//! Error types for rho-engine

use std::path::PathBuf;

use thiserror::Error;

use crate::types::BackendKind;

/// Result type alias using rho-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when loading or driving an inference backend
#[derive(Error, Debug)]
pub enum Error {
    /// No model is available for the request
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The model has never been fetched from its repository
    #[error("Model not downloaded: {repo_id}")]
    ModelNotDownloaded { repo_id: String },

    /// A local model file vanished from disk
    #[error("Model file missing: {}", path.display())]
    ModelFileMissing { path: PathBuf },

    /// No session is registered for the backend kind
    #[error("Backend not supported: {0}")]
    UnsupportedBackend(BackendKind),

    /// The backend failed while loading or generating
    #[error("Provider error: {0}")]
    Provider(String),

    /// Generation was stopped before it finished
    #[error("Generation aborted")]
    Aborted,

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a provider error from any displayable message
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Check if this error means the model's weights are not on disk
    pub fn is_missing_model(&self) -> bool {
        matches!(
            self,
            Error::ModelNotDownloaded { .. } | Error::ModelFileMissing { .. }
        )
    }

    /// Check if this error is the result of a stop request
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_variants() {
        assert!(Error::ModelNotDownloaded { repo_id: "org/model".into() }.is_missing_model());
        assert!(Error::ModelFileMissing { path: "/tmp/m.gguf".into() }.is_missing_model());
        assert!(!Error::ModelNotFound("x".into()).is_missing_model());
        assert!(!Error::provider("boom").is_missing_model());
    }

    #[test]
    fn test_aborted() {
        assert!(Error::Aborted.is_aborted());
        assert!(!Error::provider("boom").is_aborted());
    }

    #[test]
    fn test_display_includes_path() {
        let e = Error::ModelFileMissing { path: "/models/a.gguf".into() };
        assert_eq!(e.to_string(), "Model file missing: /models/a.gguf");
    }

    #[test]
    fn test_display_unsupported_backend() {
        let e = Error::UnsupportedBackend(BackendKind::Remote);
        assert_eq!(e.to_string(), "Backend not supported: remote");
    }
}
