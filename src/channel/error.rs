// src/channel/error.rs

use thiserror::Error;

use crate::platform::{ControlError, StoreError};

/// How the retry policy treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The guest rejected our credentials; a fresh setup may recover
    AuthExpired,

    /// Anything else
    Fatal,
}

/// Error raised by channel operations
#[derive(Error, Debug)]
pub enum ChannelError {
    /// HTTP 401 from the guest service
    #[error("Guest service rejected the channel credentials")]
    AuthExpired,

    /// The guest service never reported itself attached
    #[error("Guest service for {0} is unreachable")]
    ServiceUnreachable(String),

    /// Guest tags do not allow the operation
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// HTTP 404 from the guest service
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Any other non-success status
    #[error("Guest service answered HTTP {status}")]
    Http {
        /// Status code received
        status: u16,
    },

    /// Connection failure or timeout
    #[error("Request to guest service failed: {0}")]
    Transport(String),

    /// The published daemon address does not form a URL
    #[error("Invalid guest service endpoint {0}")]
    InvalidEndpoint(String),

    /// Key or value outside the accepted bounds
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Payload that is not UTF-8 text
    #[error("Invalid reply from guest service: {0}")]
    InvalidReply(String),

    /// Missing or duplicated management interface
    #[error("Management interface: {0}")]
    ManagementInterface(String),

    /// No domain id within the wait bound
    #[error("Guest {0} did not obtain a domain id")]
    GuestNotRunning(String),

    /// Toolstack failure
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Configuration store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChannelError {
    /// Classifies the error for the retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::AuthExpired => ErrorKind::AuthExpired,
            _ => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_failures_are_recoverable() {
        assert_eq!(ChannelError::AuthExpired.kind(), ErrorKind::AuthExpired);
        assert_eq!(ChannelError::Http { status: 500 }.kind(), ErrorKind::Fatal);
        assert_eq!(ChannelError::ServiceUnreachable("vm".into()).kind(), ErrorKind::Fatal);
        assert_eq!(
            ChannelError::Control(ControlError::Transport("reset".into())).kind(),
            ErrorKind::Fatal
        );
    }
}
