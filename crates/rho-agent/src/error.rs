//! Error types for rho-agent

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using rho-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the backend layer
    #[error(transparent)]
    Engine(#[from] rho_engine::Error),

    /// The chat does not exist or has no model selected
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// Generation was requested before any chat was loaded
    #[error("No chat loaded")]
    NoChatLoaded,

    /// The loop ran for too many iterations
    #[error("Too many iterations (limit {max})")]
    TooManyIterations { max: u32 },

    /// The context window is full; the conversation must be truncated
    #[error("Context limit exceeded ({:.0}% used)", utilization * 100.0)]
    ContextLimitExceeded { utilization: f64 },

    /// The run was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// No sub-agent exists with this id
    #[error("Unknown sub-agent: {0}")]
    UnknownSubAgent(Uuid),

    /// Prompt construction or output parsing failed
    #[error("Context builder error: {0}")]
    ContextBuilder(String),

    /// The persistence collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if this error is a decision-chain safety limit
    pub fn is_safety_limit(&self) -> bool {
        matches!(
            self,
            Error::TooManyIterations { .. } | Error::ContextLimitExceeded { .. }
        )
    }

    /// Check if this error means the model's weights are not on disk
    pub fn is_missing_model(&self) -> bool {
        match self {
            Error::Engine(e) => e.is_missing_model(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_limits() {
        assert!(Error::TooManyIterations { max: 10 }.is_safety_limit());
        assert!(Error::ContextLimitExceeded { utilization: 0.95 }.is_safety_limit());
        assert!(!Error::Cancelled.is_safety_limit());
        assert!(!Error::NoChatLoaded.is_safety_limit());
    }

    #[test]
    fn test_context_limit_display() {
        let e = Error::ContextLimitExceeded { utilization: 0.934 };
        assert_eq!(e.to_string(), "Context limit exceeded (93% used)");
    }

    #[test]
    fn test_engine_passthrough() {
        let e: Error = rho_engine::Error::ModelNotDownloaded {
            repo_id: "org/m".into(),
        }
        .into();
        assert!(e.is_missing_model());
        assert_eq!(e.to_string(), "Model not downloaded: org/m");
    }
}
