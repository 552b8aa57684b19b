//! Core error type shared across the workspace.

use thiserror::Error;

/// Errors produced by core domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input failed validation (bad link, unknown user, malformed batch).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A configuration value is missing or out of range.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Settings file could not be parsed.
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
