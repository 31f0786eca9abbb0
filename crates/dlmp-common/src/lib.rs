//! # DLMP Common
//!
//! Common utilities, error types, and logging configuration for the DLMP offline agent.
//!
//! ## Features
//!
//! - Shared error type for setup failures
//! - Logging configuration and setup
//! - Guarded task spawning: failures and panics of background work are logged, never propagated

use thiserror::Error;

pub mod logging;
pub mod task;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use task::{panic_message, spawn_guarded};

/// Errors raised by the common infrastructure.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Logging could not be initialised.
    #[error("Logging error: {0}")]
    Logging(String),

    /// Configuration could not be read or parsed.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CommonError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_config_error_without_source() {
        let err = CommonError::config("origin is not a URL");
        assert_eq!(err.to_string(), "Config error: origin is not a URL");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_config_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "agent.json");
        let err = CommonError::config_with_source("cannot read config", io);
        assert_eq!(err.to_string(), "Config error: cannot read config");
        assert!(err.source().is_some());
    }
}
