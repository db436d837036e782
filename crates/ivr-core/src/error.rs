//! Error types for IVR line operations

use thiserror::Error;

use crate::driver::DriverFault;

/// Result type for line operations
pub type LineResult<T> = Result<T, LineError>;

/// Errors that can surface from a line
///
/// `Hangup`, `Disposing` and `DigitsTimeout` describe expected call flow rather than
/// failures; callers usually match on them. `Driver` is always fatal for the operation
/// that produced it and is never retried by the library.
#[derive(Debug, Error)]
pub enum LineError {
    /// A request-path driver call returned a failure
    #[error("Driver error in {operation} (code {code}): {message}")]
    Driver {
        operation: String,
        code: i32,
        message: String,
    },

    /// The caller hung up, or the call was released
    #[error("The call has been hung up")]
    Hangup,

    /// Line teardown was requested while an operation was in progress
    #[error("The line is being disposed")]
    Disposing,

    /// The line has already been disposed
    #[error("Line {line} has already been disposed")]
    Disposed { line: u32 },

    /// Inter-digit timeout with no timeout terminator configured
    #[error("Timed out waiting for digits")]
    DigitsTimeout,

    /// The prompt engine exhausted its attempt budget
    #[error("Too many attempts")]
    TooManyAttempts,

    /// Waiting for an event failed at the driver level
    #[error("Failed waiting for the {event} event")]
    WaitFailed { event: String },

    /// Waiting for an event ran out of polling budget
    #[error("Timed out waiting for the {event} event")]
    WaitExpired { event: String },

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Invalid state error
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl LineError {
    /// Create a driver error for the named operation
    pub fn driver(operation: impl Into<String>, fault: DriverFault) -> Self {
        Self::Driver {
            operation: operation.into(),
            code: fault.code,
            message: fault.message,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn wait_failed(event: impl std::fmt::Display) -> Self {
        Self::WaitFailed {
            event: event.to_string(),
        }
    }

    pub fn wait_expired(event: impl std::fmt::Display) -> Self {
        Self::WaitExpired {
            event: event.to_string(),
        }
    }

    /// The remote party hung up or the call was released
    pub fn is_hangup(&self) -> bool {
        matches!(self, Self::Hangup)
    }

    /// The line is being torn down, or already has been
    pub fn is_disposing(&self) -> bool {
        matches!(self, Self::Disposing | Self::Disposed { .. })
    }

    /// Whether the line can keep serving calls after this error
    ///
    /// A hang-up leaves the line reusable for the next call, and so do timeouts and
    /// exhausted prompts. Driver failures and teardown do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Hangup
                | Self::DigitsTimeout
                | Self::TooManyAttempts
                | Self::WaitExpired { .. }
                | Self::InvalidArgument { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_carries_fault() {
        let err = LineError::driver("acknowledge", DriverFault::new(-3, "bad crn"));
        match &err {
            LineError::Driver { operation, code, message } => {
                assert_eq!(operation, "acknowledge");
                assert_eq!(*code, -3);
                assert_eq!(message, "bad crn");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Driver error in acknowledge (code -3): bad crn");
    }

    #[test]
    fn test_classification() {
        assert!(LineError::Hangup.is_hangup());
        assert!(LineError::Hangup.is_recoverable());
        assert!(LineError::Disposing.is_disposing());
        assert!(LineError::Disposed { line: 2 }.is_disposing());
        assert!(!LineError::Disposing.is_recoverable());
        assert!(LineError::TooManyAttempts.is_recoverable());
    }
}
