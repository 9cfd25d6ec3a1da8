//! Rightsizer error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Rightsizer result type
pub type Result<T> = std::result::Result<T, RightsizerError>;

/// How an error propagates through the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry at most once within the tick, otherwise skip and retry next tick
    Transient,
    /// Recorded as an outcome, the tick proceeds
    Logical,
    /// The scheduler refuses to start (or the shell exits non-zero)
    Fatal,
}

/// Rightsizer errors
#[derive(Debug, Error)]
pub enum RightsizerError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration is invalid
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A resource quantity string could not be parsed
    #[error("Invalid quantity {value:?}: {message}")]
    InvalidQuantity { value: String, message: String },

    /// Pod not found in the cluster
    #[error("Pod not found: {namespace}/{name}")]
    PodNotFound { namespace: String, name: String },

    /// Node not found in the cluster
    #[error("Node not found: {name}")]
    NodeNotFound { name: String },

    /// Container not present in a pod spec
    #[error("Container not found: {pod}/{container}")]
    ContainerNotFound { pod: String, container: String },

    /// Orchestrator API call failed
    #[error("API error: {message}")]
    Api { message: String, retryable: bool },

    /// The caller is not permitted to perform the operation
    #[error("Permission denied: {operation}")]
    PermissionDenied { operation: String },

    /// Remote operation exceeded its deadline
    #[error("Operation {operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// Metrics backend failure
    #[error("Metrics error: {message}")]
    Metrics { message: String },

    /// Leadership was lost to another instance
    #[error("Leadership lost: {message}")]
    LeaderLost { message: String },
}

impl RightsizerError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new retryable API error
    pub fn api_retryable(message: impl Into<String>) -> Self {
        Self::Api { message: message.into(), retryable: true }
    }

    /// Create a new non-retryable API error
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api { message: message.into(), retryable: false }
    }

    /// Create a new metrics error
    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics { message: message.into() }
    }

    /// Create a new invalid-quantity error
    pub fn quantity(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidQuantity { value: value.into(), message: message.into() }
    }

    /// Whether a single immediate retry is worthwhile
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Metrics { .. } => true,
            _ => false,
        }
    }

    /// Propagation class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. }
            | Self::InvalidQuantity { .. }
            | Self::Yaml(_)
            | Self::LeaderLost { .. } => ErrorKind::Fatal,
            Self::Api { .. }
            | Self::Timeout { .. }
            | Self::Metrics { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Transient,
            Self::PodNotFound { .. }
            | Self::NodeNotFound { .. }
            | Self::ContainerNotFound { .. }
            | Self::PermissionDenied { .. } => ErrorKind::Logical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RightsizerError::api_retryable("503").is_retryable());
        assert!(!RightsizerError::api("404").is_retryable());
        assert!(!RightsizerError::config("bad").is_retryable());
    }

    #[test]
    fn kind_classification() {
        assert_eq!(RightsizerError::config("min > max").kind(), ErrorKind::Fatal);
        assert_eq!(RightsizerError::api("500").kind(), ErrorKind::Transient);
        assert_eq!(
            RightsizerError::PermissionDenied { operation: "patch".into() }.kind(),
            ErrorKind::Logical
        );
    }
}
