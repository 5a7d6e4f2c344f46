//! Error types for stack deployment

use std::time::Duration;

use thiserror::Error;

/// Main error type for nbstack operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid parameter, raised before any external side effect
    #[error("validation error: {0}")]
    Validation(String),

    /// Non-zero exit from a required external tool invocation
    #[error("command failed: {command} - {message}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Captured stderr, or a description of the failure
        message: String,
    },

    /// A probe did not return a result within its retry budget
    #[error("{what} not ready after {tries} tries at {delay:?} intervals")]
    PollTimeout {
        /// What was being waited for
        what: String,
        /// Number of attempts made
        tries: u32,
        /// Fixed sleep between attempts
        delay: Duration,
    },

    /// A required executable is absent from the search path
    #[error("prerequisite not found: {tool} - {hint}")]
    PrerequisiteNotFound {
        /// The tool that was not found
        tool: String,
        /// Hint for how to install it
        hint: String,
    },

    /// Hosted-zone lookup or record change failed
    #[error("dns error: {0}")]
    Dns(String),

    /// Malformed parameter document
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Manifest template rendering failed
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a command failure for the given argv and message
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a DNS error with the given message
    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns(msg.into())
    }

    /// Create an invalid-config error with the given message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
