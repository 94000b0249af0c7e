//! Error types for the Cowstream core library

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Cowstream operations
#[derive(Error, Debug)]
pub enum Error {
    /// Device is not known to the device map
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// A job is already running on the device
    #[error("Device '{0}' is in use by an active block job")]
    JobActive(String),

    /// Control operation targeted a device without an active job
    #[error("No active block job on device '{0}'")]
    NoActiveJob(String),

    /// Requested speed is negative
    #[error("Invalid parameter 'speed': {0} is negative")]
    InvalidSpeed(i64),

    /// Base is not a layer below the top of the device's chain
    #[error("Base '{base}' not found in the backing chain of device '{device}'")]
    InvalidBase {
        /// Device whose chain was searched
        device: String,
        /// Requested base layer name
        base: String,
    },

    /// Access beyond the end of a layer or device
    #[error("Access of {len} bytes at offset {offset} exceeds size {size}")]
    OutOfRange {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: u64,
        /// Size of the accessed object
        size: u64,
    },

    /// Failure reported by an image layer
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error during read/write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed control request
    #[error("Invalid request: {0}")]
    Protocol(String),

    /// Unknown control command
    #[error("The command {0} has not been found")]
    CommandNotFound(String),
}

impl Error {
    /// Wire error class reported to control clients
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DeviceNotFound(_) => ErrorClass::DeviceNotFound,
            Error::CommandNotFound(_) => ErrorClass::CommandNotFound,
            _ => ErrorClass::GenericError,
        }
    }

    /// Whether this error rejects a control command before any state changed
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound(_)
                | Error::JobActive(_)
                | Error::NoActiveJob(_)
                | Error::InvalidSpeed(_)
                | Error::InvalidBase { .. }
                | Error::InvalidConfig(_)
                | Error::Protocol(_)
                | Error::CommandNotFound(_)
        )
    }
}

/// Error classes of the control protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Catch-all class
    GenericError,
    /// The named device does not exist
    DeviceNotFound,
    /// The named command does not exist
    CommandNotFound,
}

/// Result type alias using the Cowstream error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DeviceNotFound("drive0".to_string());
        assert!(err.to_string().contains("drive0"));

        let err = Error::InvalidSpeed(-1);
        assert!(err.to_string().contains("-1"));

        let err = Error::OutOfRange {
            offset: 4096,
            len: 512,
            size: 1024,
        };
        assert!(err.to_string().contains("4096"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            Error::DeviceNotFound("x".into()).class(),
            ErrorClass::DeviceNotFound
        );
        assert_eq!(
            Error::CommandNotFound("x".into()).class(),
            ErrorClass::CommandNotFound
        );
        assert_eq!(Error::InvalidSpeed(-5).class(), ErrorClass::GenericError);
        assert_eq!(Error::JobActive("x".into()).class(), ErrorClass::GenericError);
        assert_eq!(Error::NoActiveJob("x".into()).class(), ErrorClass::GenericError);
    }

    #[test]
    fn test_error_class_serializes_as_name() {
        let json = serde_json::to_string(&ErrorClass::GenericError).unwrap();
        assert_eq!(json, "\"GenericError\"");
    }

    #[test]
    fn test_validation_errors() {
        assert!(Error::InvalidSpeed(-1).is_validation());
        assert!(Error::InvalidBase {
            device: "d".into(),
            base: "b".into()
        }
        .is_validation());
        assert!(!Error::Storage("disk on fire".into()).is_validation());
    }
}
