// Observer error types
// Configuration failures are loud; channel failures are expected and recoverable.

use thiserror::Error;

/// Failure reading from or acting on a platform channel.
///
/// These are expected during normal operation: a channel may already have
/// progressed past the window in which headers, cookies or cache state can
/// be read, or may have finished before a cancel arrives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The requested data is no longer (or not yet) readable
    #[error("channel data not available: {0}")]
    NotAvailable(&'static str),

    /// The channel already completed
    #[error("channel already finished")]
    AlreadyFinished,

    /// The channel implementation does not support the operation
    #[error("operation not supported by channel: {0}")]
    Unsupported(&'static str),
}

impl ChannelError {
    /// Whether this failure is part of the normal channel lifecycle
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NotAvailable(_) | Self::AlreadyFinished)
    }
}

/// Errors surfaced by the network observer
#[derive(Error, Debug)]
pub enum ObserverError {
    /// Missing or invalid construction parameters
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A channel operation failed
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl ObserverError {
    /// Create a configuration error
    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration(details.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_channel_errors() {
        assert!(ChannelError::NotAvailable("headers").is_expected());
        assert!(ChannelError::AlreadyFinished.is_expected());
        assert!(!ChannelError::Unsupported("cancel").is_expected());
    }

    #[test]
    fn test_channel_error_converts() {
        let error: ObserverError = ChannelError::AlreadyFinished.into();
        assert!(matches!(error, ObserverError::Channel(ChannelError::AlreadyFinished)));
        assert_eq!(error.to_string(), "channel error: channel already finished");
    }

    #[test]
    fn test_configuration_message() {
        let error = ObserverError::configuration("missing onNetworkEvent");
        assert_eq!(
            error.to_string(),
            "configuration error: missing onNetworkEvent"
        );
    }
}
