//! Error types for uf2flash.

use std::io;
use thiserror::Error;

/// Result type for uf2flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uf2flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No valid handshake or acknowledgement within the timeout window.
    ///
    /// Retryable by re-probing, possibly after a hardware reset pulse.
    #[error("Link timeout: {0}")]
    LinkTimeout(String),

    /// Unexpected response byte or frame shape. Not retried.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Local and device digests disagree over the same range.
    #[error("Checksum mismatch: expected {}, got {}", hex(.expected), hex(.actual))]
    ChecksumMismatch {
        /// Digest reported by the device.
        expected: Vec<u8>,
        /// Digest computed locally.
        actual: Vec<u8>,
    },

    /// Requested offset/length exceeds device or file capacity.
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Bad magic, inconsistent block count, truncated tag.
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Container or file references a chip family with no implemented protocol.
    #[error("Unsupported chip family: {0}")]
    UnsupportedFamily(String),

    /// A container block names a partition the board layout cannot resolve.
    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    /// Unsupported operation or parameter.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The operation was cancelled by the caller.
    ///
    /// Not a protocol error; the device is left in whatever state the last
    /// completed chunk produced.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error is a link timeout (the only locally-retryable kind).
    #[must_use]
    pub fn is_link_timeout(&self) -> bool {
        matches!(self, Self::LinkTimeout(_))
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let err = Error::ChecksumMismatch {
            expected: vec![0xDE, 0xAD],
            actual: vec![0xBE, 0xEF],
        };
        assert_eq!(err.to_string(), "Checksum mismatch: expected dead, got beef");
    }

    #[test]
    fn test_is_link_timeout() {
        assert!(Error::LinkTimeout("x".into()).is_link_timeout());
        assert!(!Error::Cancelled.is_link_timeout());
    }
}
