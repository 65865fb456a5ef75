use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the registry crates.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Top-level registry error type.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed or missing input, rejected before touching any model.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Model not trained yet")]
    NotTrained,

    /// The estimator could not be fitted (degenerate data, non-finite output, ...).
    #[error("Training failed: {0}")]
    Training(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Classification of errors for logging and user display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Caused by the caller's input or by calling in the wrong lifecycle state.
    UserError,
    /// Storage, serialization or other internal failure.
    SystemError,
    /// Missing or rejected credentials.
    SecurityError,
    /// Invalid configuration.
    ConfigError,
}

impl RegistryError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn training(message: impl Into<String>) -> Self {
        Self::Training(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Stable, machine-readable name of the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::NotTrained => "NotTrainedError",
            Self::Training(_) => "TrainingError",
            Self::Persistence(_) => "PersistenceError",
            Self::Serialization(_) => "SerializationError",
            Self::NotFound(_) => "NotFoundError",
            Self::Unauthorized(_) => "UnauthorizedError",
            Self::Config(_) => "ConfigError",
        }
    }

    /// Returns the broad error category for routing and display purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } | Self::NotTrained | Self::Training(_) | Self::NotFound(_) => {
                ErrorCategory::UserError
            }
            Self::Persistence(_) | Self::Serialization(_) => ErrorCategory::SystemError,
            Self::Unauthorized(_) => ErrorCategory::SecurityError,
            Self::Config(_) => ErrorCategory::ConfigError,
        }
    }

    /// Field the error refers to, for validation failures.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Returns a user-friendly message (hides internal details).
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { field, message } => format!("Invalid {field}: {message}"),
            Self::NotTrained => "Model not trained yet. Train a model before predicting.".into(),
            Self::Training(msg) => format!("Training failed: {msg}"),
            Self::Persistence(_) => "Storage error. Check disk space and permissions.".into(),
            Self::Serialization(_) => "The stored model could not be read or written.".into(),
            Self::NotFound(msg) => format!("Not found: {msg}"),
            Self::Unauthorized(_) => "Missing or invalid API key.".into(),
            Self::Config(msg) => format!("Configuration issue: {msg}"),
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(RegistryError::NotTrained.kind(), "NotTrainedError");
        assert_eq!(
            RegistryError::validation("features", "empty").kind(),
            "ValidationError"
        );
        assert_eq!(RegistryError::training("x").kind(), "TrainingError");
        assert_eq!(RegistryError::persistence("x").kind(), "PersistenceError");
        assert_eq!(RegistryError::serialization("x").kind(), "SerializationError");
    }

    #[test]
    fn test_categories() {
        assert_eq!(RegistryError::NotTrained.category(), ErrorCategory::UserError);
        assert_eq!(
            RegistryError::persistence("disk full").category(),
            ErrorCategory::SystemError
        );
        assert_eq!(
            RegistryError::Unauthorized("bad key".into()).category(),
            ErrorCategory::SecurityError
        );
        assert_eq!(
            RegistryError::Config("bad".into()).category(),
            ErrorCategory::ConfigError
        );
    }

    #[test]
    fn test_user_message_hides_system_details() {
        let err = RegistryError::persistence("/var/lib/secret/path: permission denied");
        assert!(!err.user_message().contains("/var/lib"));

        let err = RegistryError::validation("targets", "length 2 does not match 3 samples");
        assert!(err.user_message().contains("targets"));
    }

    #[test]
    fn test_field_only_for_validation() {
        assert_eq!(
            RegistryError::validation("model_type", "unknown").field(),
            Some("model_type")
        );
        assert_eq!(RegistryError::NotTrained.field(), None);
    }

    #[test]
    fn test_from_io_and_json() {
        let io = std::io::Error::other("boom");
        assert!(matches!(RegistryError::from(io), RegistryError::Persistence(_)));

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            RegistryError::from(json),
            RegistryError::Serialization(_)
        ));
    }
}
