use std::fmt;
use thiserror::Error;

/// Which wait ran out when a [`PedalError::Timeout`] is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Opening the transport took too long
    Open,
    /// No ACK/NAK byte arrived after a command was written
    Ack,
    /// No complete response arrived for the command in flight
    Response,
    /// Another exchange was still running and the caller gave up waiting
    Busy,
    /// The transport did not finish closing
    Close,
    /// Device identification did not complete
    Check,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Ack => write!(f, "ACK"),
            Self::Response => write!(f, "response"),
            Self::Busy => write!(f, "busy"),
            Self::Close => write!(f, "close"),
            Self::Check => write!(f, "check"),
        }
    }
}

/// Errors that can occur when talking to an ergometer or trainer
#[derive(Error, Debug)]
pub enum PedalError {
    /// Opening or closing the transport failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport closed underneath an active session
    #[error("Device disconnected")]
    Disconnected,

    /// A bounded wait expired
    #[error("{kind} timeout after {timeout_ms}ms")]
    Timeout {
        /// What was being waited for
        kind: TimeoutKind,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The device answered with something that does not belong to the command
    #[error("Illegal response: {0}")]
    IllegalResponse(String),

    /// A framed response failed checksum validation
    #[error("Checksum mismatch: expected {expected:02}, got {actual:02}")]
    ChecksumMismatch {
        /// Checksum computed over the received body
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
    },

    /// Invalid input to a calculation or setting
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A command was issued while the channel was down
    #[error("Not connected")]
    NotConnected,

    /// The channel has been disabled and rejects all traffic
    #[error("Channel blocked")]
    Blocked,

    /// The transport path is already claimed by another connection
    #[error("Port in use: {0}")]
    PortInUse(String),

    /// Response parsing failed
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for pedalers operations
pub type Result<T> = std::result::Result<T, PedalError>;

impl PedalError {
    /// Shorthand for a timeout error
    #[must_use]
    pub const fn timeout(kind: TimeoutKind, timeout_ms: u64) -> Self {
        Self::Timeout { kind, timeout_ms }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::NotConnected
                | Self::PortInUse(_)
                | Self::Io(_)
        )
    }

    /// Check if this error is a timeout, optionally of a specific kind
    #[must_use]
    pub fn is_timeout(&self, kind: Option<TimeoutKind>) -> bool {
        match self {
            Self::Timeout { kind: actual, .. } => kind.is_none_or(|k| k == *actual),
            _ => false,
        }
    }

    /// Check if the device sent something the protocol does not allow
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalResponse(_) | Self::ChecksumMismatch { .. } | Self::ParseError(_)
        )
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::IllegalResponse(_)
                | Self::ChecksumMismatch { .. }
                | Self::ParseError(_)
                | Self::NotConnected
                | Self::ConnectionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = PedalError::ConnectionFailed("refused".to_string());
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_recoverable());
        assert!(!connection_error.is_protocol_error());

        let ack_timeout = PedalError::timeout(TimeoutKind::Ack, 500);
        assert!(ack_timeout.is_timeout(None));
        assert!(ack_timeout.is_timeout(Some(TimeoutKind::Ack)));
        assert!(!ack_timeout.is_timeout(Some(TimeoutKind::Response)));
        assert!(!ack_timeout.is_connection_error());

        let blocked = PedalError::Blocked;
        assert!(!blocked.is_recoverable());
        assert!(!blocked.is_connection_error());

        let checksum = PedalError::ChecksumMismatch {
            expected: 42,
            actual: 7,
        };
        assert!(checksum.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let error = PedalError::timeout(TimeoutKind::Response, 1000);
        assert_eq!(format!("{error}"), "response timeout after 1000ms");

        let error = PedalError::ChecksumMismatch {
            expected: 5,
            actual: 42,
        };
        assert_eq!(format!("{error}"), "Checksum mismatch: expected 05, got 42");

        let error = PedalError::InvalidArgument("negative mass".to_string());
        assert!(format!("{error}").contains("negative mass"));
    }
}
