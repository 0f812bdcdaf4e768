//! Sniffer Error Types
//!
//! Only configuration and transport problems are errors. Corrupted,
//! short or unknown frames are data and travel through the pipeline.

use thiserror::Error;

/// Result type for rtu-sniffer operations
pub type Result<T> = std::result::Result<T, SnifferError>;

/// Sniffer errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnifferError {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration loaded but a field is out of range
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Serial port could not be opened or was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// A pipeline channel was closed unexpectedly
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Internal errors (task panics, join failures)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SnifferError {
    fn from(err: std::io::Error) -> Self {
        SnifferError::Io(err.to_string())
    }
}

impl From<figment::Error> for SnifferError {
    fn from(err: figment::Error) -> Self {
        SnifferError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SnifferError {
    fn from(err: tokio::task::JoinError) -> Self {
        SnifferError::Internal(format!("pipeline task failed: {err}"))
    }
}

// Helper methods for creating errors
impl SnifferError {
    pub fn config(msg: impl Into<String>) -> Self {
        SnifferError::Config(msg.into())
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SnifferError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        SnifferError::Transport(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        SnifferError::ChannelClosed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SnifferError::Internal(msg.into())
    }

    /// Whether this error ends a capture session
    pub fn is_fatal(&self) -> bool {
        matches!(self, SnifferError::Transport(_) | SnifferError::Io(_))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SnifferError::invalid_config("link.baud_rate", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: link.baud_rate: must be greater than 0"
        );
        assert_eq!(
            SnifferError::transport("port /dev/ttyUSB0 vanished").to_string(),
            "Transport error: port /dev/ttyUSB0 vanished"
        );
    }

    #[test]
    fn test_only_transport_faults_are_fatal() {
        assert!(SnifferError::transport("lost").is_fatal());
        assert!(SnifferError::from(std::io::Error::other("read failed")).is_fatal());
        assert!(!SnifferError::config("bad yaml").is_fatal());
        assert!(!SnifferError::channel_closed("events").is_fatal());
    }
}
