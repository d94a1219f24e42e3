//! Event-stream parsing error definitions

use std::fmt;

/// Parse error types
#[derive(Debug)]
pub enum ParseError {
    /// Insufficient data, need more bytes
    Incomplete { needed: usize, available: usize },
    /// Prelude CRC verification failed
    PreludeCrcMismatch { expected: u32, actual: u32 },
    /// Message CRC verification failed
    MessageCrcMismatch { expected: u32, actual: u32 },
    /// Invalid header value type tag
    InvalidHeaderType(u8),
    /// Header parsing error
    HeaderParseFailed(String),
    /// Frame length exceeds limit
    MessageTooLarge { length: u32, max: u32 },
    /// Frame length below the fixed overhead
    MessageTooSmall { length: u32, min: u32 },
    /// Invalid message type header
    InvalidMessageType(String),
    /// Payload deserialization failed
    PayloadDeserialize(serde_json::Error),
    /// Too many recovery events, decoder stopped
    TooManyErrors { count: usize, last_error: String },
    /// Staging ring cannot absorb more bytes without draining
    BufferOverflow { size: usize, max: usize },
}

impl std::error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete { needed, available } => {
                write!(f, "insufficient data: need {} bytes, have {}", needed, available)
            }
            Self::PreludeCrcMismatch { expected, actual } => {
                write!(
                    f,
                    "prelude CRC mismatch: expected 0x{:08x}, actual 0x{:08x}",
                    expected, actual
                )
            }
            Self::MessageCrcMismatch { expected, actual } => {
                write!(
                    f,
                    "message CRC mismatch: expected 0x{:08x}, actual 0x{:08x}",
                    expected, actual
                )
            }
            Self::InvalidHeaderType(t) => write!(f, "invalid header value type: {}", t),
            Self::HeaderParseFailed(msg) => write!(f, "header parsing failed: {}", msg),
            Self::MessageTooLarge { length, max } => {
                write!(f, "frame too large: {} bytes (max {})", length, max)
            }
            Self::MessageTooSmall { length, min } => {
                write!(f, "frame too small: {} bytes (min {})", length, min)
            }
            Self::InvalidMessageType(t) => write!(f, "invalid message type: {}", t),
            Self::PayloadDeserialize(e) => write!(f, "payload deserialization failed: {}", e),
            Self::TooManyErrors { count, last_error } => {
                write!(f, "too many recovery events ({}), decoder stopped: {}", count, last_error)
            }
            Self::BufferOverflow { size, max } => {
                write!(f, "staging buffer overflow: {} bytes (max {})", size, max)
            }
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::PayloadDeserialize(e)
    }
}

/// Parse result type
pub type ParseResult<T> = Result<T, ParseError>;
