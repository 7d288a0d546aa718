//! Error types for the shortlink relay

use crate::api::ApiFailure;
use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Server URL or credential missing
    Configuration(String),

    /// Network failure, non-2xx status or undecodable body
    Transport(String),

    /// No relay response before the caller's deadline
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The remote API answered with `status: fail`
    Application(ApiFailure),

    /// Persisted state could not be read or written
    Storage(String),

    /// Input rejected before any request was made
    InvalidInput(String),

    /// Generic error with message
    Other(String),
}

impl RelayError {
    /// True for failures the user may retry by hand.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::Timeout { .. })
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RelayError::Timeout { operation, after } => write!(
                f,
                "{} timed out after {}s; the server may still be processing it",
                operation,
                after.as_secs()
            ),
            RelayError::Application(failure) => write!(f, "API error: {}", failure),
            RelayError::Storage(msg) => write!(f, "Storage error: {}", msg),
            RelayError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            RelayError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Storage(format!("malformed JSON: {}", err))
    }
}
