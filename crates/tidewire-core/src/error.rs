//! Error types shared by every tidewire crate.
//!
//! Most protocol failures never reach the application: the peer drops the
//! offending command and keeps going. These types describe what went wrong
//! inside the codec and on the application-facing `send` path.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Reasons a wire structure could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodingErrorKind {
    /// The command number is not one the protocol defines.
    #[error("unknown command number {0}")]
    UnknownCommand(u8),
    /// The buffer ended before the structure was complete.
    #[error("buffer truncated")]
    Truncated,
    /// A length field disagrees with the bytes that follow it.
    #[error("length field does not match payload")]
    LengthMismatch,
    /// The datagram header is malformed.
    #[error("invalid datagram header")]
    InvalidHeader,
}

/// Every error a tidewire operation can return.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A wire structure failed to decode.
    #[error("decoding error: {0}")]
    DecodingError(#[from] DecodingErrorKind),
    /// The datagram header could not be read.
    #[error("could not read header: {0}")]
    CouldNotReadHeader(String),
    /// The datagram checksum did not match its contents.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// An application packet exceeds the configured maximum size.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The channel id is outside the negotiated channel range.
    #[error("channel {0} is not open on this peer")]
    InvalidChannel(u8),
    /// The peer is not in a state that accepts application data.
    #[error("peer is not connected")]
    NotConnected,
    /// Fragmenting the payload would exceed the maximum fragment count.
    #[error("payload requires too many fragments")]
    FragmentCountExceeded,
    /// A well-formed command arrived that the connection cannot accept.
    #[error("unexpected command: {0}")]
    UnexpectedCommand(&'static str),
    /// Too much received data is waiting for the application.
    #[error("waiting data limit exceeded")]
    WaitingDataExceeded,
    /// A configuration value is outside the bounds the protocol supports.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An I/O error from the datagram sink.
    #[error("i/o error: {0}")]
    IOError(#[from] io::Error),
}
