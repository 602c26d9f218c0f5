//! Error types for socksix
//!
//! This module defines the error types used throughout the server: the
//! crate-level [`SocksixError`] and the wire-codec [`MessageError`].

use std::io;
use thiserror::Error;

/// Main error type for socksix operations
#[derive(Error, Debug)]
pub enum SocksixError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol error
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),
}

/// Errors produced while parsing or marshalling SOCKS 6 messages
#[derive(Error, Debug)]
pub enum MessageError {
    /// IO error while reading from the stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The first byte was not the SOCKS 6 version byte.
    ///
    /// Carries the observed version byte and every byte consumed from the
    /// stream so far, so a version-mismatch handler can answer in the
    /// protocol the client is actually speaking.
    #[error("protocol version mismatch: got {version}")]
    VersionMismatch {
        /// First byte read from the wire
        version: u8,
        /// Bytes consumed before the mismatch was detected
        consumed: Vec<u8>,
    },

    /// Unknown or unsupported address type byte
    #[error("address type not supported: {0}")]
    AddressNotSupported(u8),

    /// Structurally invalid message
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl MessageError {
    /// True when the error indicates a non-SOCKS6 client.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, MessageError::VersionMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_error_display() {
        let err = MessageError::VersionMismatch {
            version: 5,
            consumed: vec![5],
        };
        assert_eq!(format!("{}", err), "protocol version mismatch: got 5");

        let err = MessageError::AddressNotSupported(9);
        assert_eq!(format!("{}", err), "address type not supported: 9");

        let err = MessageError::Malformed("truncated option".to_string());
        assert_eq!(format!("{}", err), "malformed message: truncated option");
    }

    #[test]
    fn test_is_version_mismatch() {
        let err = MessageError::VersionMismatch {
            version: b'G',
            consumed: vec![b'G'],
        };
        assert!(err.is_version_mismatch());
        assert!(!MessageError::AddressNotSupported(2).is_version_mismatch());
    }

    #[test]
    fn test_socksix_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "io error");
        let err: SocksixError = io_err.into();
        assert!(matches!(err, SocksixError::Io(_)));
    }

    #[test]
    fn test_socksix_error_from_message() {
        let err: SocksixError = MessageError::AddressNotSupported(7).into();
        assert!(matches!(err, SocksixError::Message(_)));
    }

    #[test]
    fn test_socksix_error_display() {
        let err = SocksixError::Config("missing listen address".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: missing listen address"
        );

        let err = SocksixError::Auth("bad credentials".to_string());
        assert_eq!(format!("{}", err), "Authentication error: bad credentials");
    }

    #[test]
    fn test_unexpected_eof_wraps_as_io() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err: MessageError = io_err.into();
        assert!(matches!(err, MessageError::Io(_)));
        assert!(!err.is_version_mismatch());
    }
}
