//! Session error kinds
//!
//! Every failure the session can report is a discrete, recoverable outcome.
//! None of them terminate the process.

use thiserror::Error;
use uuid::Uuid;

/// Errors delivered through an operation's completion or returned by a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,
    #[error("A scan is already running")]
    AlreadyScanning,
    #[error("Connection is not ready")]
    NotReady,
    #[error("Characteristic {0} not found on the connected peripheral")]
    ResourceNotFound(Uuid),
    #[error("Operation timed out")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Empty payload")]
    EmptyPayload,
    #[error("GATT operation failed with status {status:#04x}")]
    OperationFailed { status: u8 },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Session worker has shut down")]
    SessionClosed,
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let err = SessionError::OperationFailed { status: 0x05 };
        assert_eq!(err.to_string(), "GATT operation failed with status 0x05");
    }
}
