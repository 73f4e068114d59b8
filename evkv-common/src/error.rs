//! # Codec Errors
//!
//! Failures raised while decoding RESP2 frames. Any of these means the peer
//! broke framing, so the connection carrying the frame cannot be trusted.

use thiserror::Error;

/// Result type for the RESP2 codec.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors surfaced by the RESP2 decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First byte of a frame is not one of `+ - : $ *`.
    #[error("unknown frame type byte {0:#04x}")]
    UnknownType(u8),
    /// Length or integer field is not a valid decimal number.
    #[error("invalid integer in frame")]
    InvalidInteger,
    /// A line or bulk payload is not terminated by CRLF.
    #[error("frame is not terminated by CRLF")]
    MissingCrlf,
    /// A frame header line carries no type byte.
    #[error("empty frame line")]
    EmptyLine,
    /// Bulk string length exceeds the decoder limit.
    #[error("bulk string of {len} bytes exceeds limit of {max}")]
    BulkTooLarge { len: usize, max: usize },
}
