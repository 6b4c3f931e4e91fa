//! Error types for atrium.
//!
//! Two layers of failure exist in the server: wire-level protocol errors
//! (a client sent bytes we cannot interpret) and engine-level status codes
//! (the storage engine rejected or deferred an operation). Protocol errors
//! terminate connections; engine codes are mapped onto wire status codes
//! and sent back to the client.

use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type alias for atrium operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for atrium.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection errors
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource limit exceeded
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),

    /// Address parsing error
    #[error("address parse error: {0}")]
    AddrParse(#[from] AddrParseError),
}

/// Wire-level errors raised while decoding or validating packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first byte is not one of the recognized magic values
    #[error("invalid magic: {0:#04x}")]
    InvalidMagic(u8),

    /// The declared body length exceeds the configured maximum
    #[error("packet too large: {len} bytes (max: {max})")]
    PacketTooLarge {
        /// Declared total body length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Header section lengths do not fit in the declared body
    #[error("section lengths exceed body: framing {framing} + extras {extras} + key {key} > body {body}")]
    SectionOverflow {
        /// Framing extras length
        framing: usize,
        /// Extras length
        extras: usize,
        /// Key length
        key: usize,
        /// Total body length
        body: usize,
    },

    /// A frame-info item ran past the end of the framing extras
    #[error("frame info overruns framing extras")]
    FrameInfoOverrun,

    /// A frame-info id is not recognized
    #[error("unknown frame info id: {0}")]
    UnknownFrameInfo(u16),

    /// A frame-info payload has the wrong size for its id
    #[error("invalid frame info payload size for id {id}: {len}")]
    InvalidFrameInfoSize {
        /// Frame info id
        id: u16,
        /// Offending payload length
        len: usize,
    },

    /// Unexpected end of input
    #[error("unexpected end of input")]
    UnexpectedEof,
}

impl Error {
    /// Returns true if this error should terminate the connection.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Io(_) | Error::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::InvalidMagic(0x42);
        assert_eq!(err.to_string(), "invalid magic: 0x42");

        let err = ProtocolError::PacketTooLarge {
            len: 40_000_000,
            max: 30_000_000,
        };
        assert!(err.to_string().contains("40000000"));
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Protocol(ProtocolError::UnexpectedEof).is_fatal());
        assert!(!Error::Config("bad port".into()).is_fatal());
    }
}
