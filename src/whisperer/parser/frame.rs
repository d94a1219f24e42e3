//! Event-stream message frame parsing
//!
//! ## Message Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────┬──────────┬───────────┐
//! │ Total Length │ Header Length│ Prelude CRC  │ Headers  │ Payload  │ Msg CRC   │
//! │   (4 bytes)  │   (4 bytes)  │   (4 bytes)  │ (var)    │ (var)    │ (4 bytes) │
//! └──────────────┴──────────────┴──────────────┴──────────┴──────────┴───────────┘
//! ```
//!
//! All integers are big-endian. The prelude CRC covers the first 8 bytes, the
//! message CRC covers everything before itself. A frame is therefore at least
//! 16 bytes and, by protocol limit, at most 16 MiB.

use super::crc::crc32;
use super::error::{ParseError, ParseResult};
use super::header::{Headers, parse_headers_lossy};

/// Prelude fixed size (total length + header length + prelude CRC)
pub const PRELUDE_SIZE: usize = 12;

/// Minimum frame size (prelude + message CRC)
pub const MIN_FRAME_SIZE: usize = PRELUDE_SIZE + 4;

/// Maximum frame size limit (16 MiB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Parsed message frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message headers
    pub headers: Headers,
    /// Message payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Get message type
    pub fn message_type(&self) -> Option<&str> {
        self.headers.message_type()
    }

    /// Get event type
    pub fn event_type(&self) -> Option<&str> {
        self.headers.event_type()
    }

    /// Parse payload as JSON
    pub fn payload_as_json<T: serde::de::DeserializeOwned>(&self) -> ParseResult<T> {
        serde_json::from_slice(&self.payload).map_err(ParseError::PayloadDeserialize)
    }

    /// Parse payload as string (lossy)
    pub fn payload_as_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// Size of a stored CRC32 value
const CRC_SIZE: usize = 4;

fn read_u32_at(buffer: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_be_bytes(raw)
}

/// Check the CRC stored at `at` against the checksum of everything before
/// it. Both frame checksums follow this pattern: the prelude CRC at offset 8
/// covers the length pair, the message CRC at `total - 4` covers the rest of
/// the frame.
fn verify_crc(
    frame: &[u8],
    at: usize,
    mismatch: fn(expected: u32, actual: u32) -> ParseError,
) -> ParseResult<()> {
    let expected = read_u32_at(frame, at);
    let actual = crc32(&frame[..at]);
    if expected == actual {
        Ok(())
    } else {
        Err(mismatch(expected, actual))
    }
}

/// Section geometry implied by a frame's length pair.
///
/// Derived before any checksum runs, so a hostile length field is rejected
/// without touching the rest of the buffer.
#[derive(Debug, Clone)]
struct FrameLayout {
    total_len: usize,
    headers: std::ops::Range<usize>,
    payload: std::ops::Range<usize>,
}

impl FrameLayout {
    /// Derive the layout from the first 8 bytes, enforcing the length
    /// invariants: 16 ≤ total ≤ 16 MiB and headers fit inside the body.
    fn from_lengths(buffer: &[u8]) -> ParseResult<Self> {
        let declared = read_u32_at(buffer, 0);
        if declared < MIN_FRAME_SIZE as u32 {
            return Err(ParseError::MessageTooSmall {
                length: declared,
                min: MIN_FRAME_SIZE as u32,
            });
        }
        if declared > MAX_FRAME_SIZE {
            return Err(ParseError::MessageTooLarge {
                length: declared,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = declared as usize;
        let body_end = total_len - CRC_SIZE;
        let headers_end = PRELUDE_SIZE + read_u32_at(buffer, 4) as usize;
        if headers_end > body_end {
            return Err(ParseError::HeaderParseFailed(
                "header length exceeds message boundary".to_string(),
            ));
        }

        Ok(Self {
            total_len,
            headers: PRELUDE_SIZE..headers_end,
            payload: headers_end..body_end,
        })
    }
}

/// Validate a prelude without consuming anything.
///
/// Returns the total frame length when the 12 prelude bytes carry a sane
/// length pair and a matching prelude CRC. Used by the decoder's
/// resynchronisation scan to find candidate frame boundaries.
pub fn probe_prelude(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < PRELUDE_SIZE {
        return None;
    }
    let layout = FrameLayout::from_lengths(buffer).ok()?;
    verify_crc(buffer, 8, |expected, actual| ParseError::PreludeCrcMismatch {
        expected,
        actual,
    })
    .ok()?;
    Some(layout.total_len)
}

/// Try to parse a complete frame from the start of `buffer`.
///
/// Stateless pure function; buffer management is handled by the
/// `EventStreamDecoder` above it.
///
/// # Returns
/// - `Ok(Some((frame, consumed)))` - successfully parsed
/// - `Ok(None)` - insufficient data, need more bytes
/// - `Err(e)` - validation failure (the caller decides strict/lax policy)
pub fn parse_frame(buffer: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    if buffer.len() < PRELUDE_SIZE {
        return Ok(None);
    }

    let layout = FrameLayout::from_lengths(buffer)?;
    if buffer.len() < layout.total_len {
        return Ok(None);
    }
    let frame = &buffer[..layout.total_len];

    verify_crc(frame, 8, |expected, actual| ParseError::PreludeCrcMismatch {
        expected,
        actual,
    })?;
    verify_crc(frame, layout.total_len - CRC_SIZE, |expected, actual| {
        ParseError::MessageCrcMismatch { expected, actual }
    })?;

    // Slice the sections through `get` so the bounds are re-checked against
    // the actual buffer, independently of the layout arithmetic
    let header_bytes = frame
        .get(layout.headers.clone())
        .ok_or_else(|| ParseError::HeaderParseFailed("header bounds out of range".to_string()))?;
    let payload_bytes = frame
        .get(layout.payload.clone())
        .ok_or_else(|| ParseError::HeaderParseFailed("payload bounds out of range".to_string()))?;

    let headers = if header_bytes.is_empty() {
        // Empty header sections are legal; assume the common event shape
        Headers::with_defaults()
    } else {
        let (headers, salvage_err) = parse_headers_lossy(header_bytes)?;
        if let Some(e) = salvage_err {
            tracing::warn!("salvaged partially decoded headers: {}", e);
        }
        headers
    };

    Ok(Some((
        Frame {
            headers,
            payload: payload_bytes.to_vec(),
        },
        layout.total_len,
    )))
}

/// Parse a buffer that must contain exactly one frame.
///
/// Unlike `parse_frame`, trailing bytes are rejected: `total-length` must
/// equal the input length.
pub fn parse_frame_exact(buffer: &[u8]) -> ParseResult<Frame> {
    match parse_frame(buffer)? {
        Some((frame, consumed)) if consumed == buffer.len() => Ok(frame),
        Some((_, consumed)) => Err(ParseError::HeaderParseFailed(format!(
            "frame length {} does not match input length {}",
            consumed,
            buffer.len()
        ))),
        None => Err(ParseError::Incomplete {
            needed: MIN_FRAME_SIZE,
            available: buffer.len(),
        }),
    }
}

/// Encode a frame for test fixtures
#[cfg(test)]
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        super::header::encode_string_header(&mut header_bytes, name, value);
    }

    let total_length = (MIN_FRAME_SIZE + header_bytes.len() + payload.len()) as u32;
    let mut out = Vec::with_capacity(total_length as usize);
    out.extend_from_slice(&total_length.to_be_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32(&out[..8]);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    let message_crc = crc32(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

#[cfg(test)]
pub fn encode_event_frame(event_type: &str, payload: &[u8]) -> Vec<u8> {
    encode_frame(
        &[
            (":message-type", "event"),
            (":event-type", event_type),
            (":content-type", "application/json"),
        ],
        payload,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_insufficient_data() {
        let buffer = [0u8; 10];
        assert!(matches!(parse_frame(&buffer), Ok(None)));
    }

    #[test]
    fn test_frame_message_too_small() {
        let mut buffer = vec![0u8; 16];
        buffer[0..4].copy_from_slice(&10u32.to_be_bytes());
        buffer[4..8].copy_from_slice(&0u32.to_be_bytes());
        let prelude_crc = crc32(&buffer[0..8]);
        buffer[8..12].copy_from_slice(&prelude_crc.to_be_bytes());

        assert!(matches!(
            parse_frame(&buffer),
            Err(ParseError::MessageTooSmall { .. })
        ));
    }

    #[test]
    fn test_frame_message_too_large() {
        let mut buffer = vec![0u8; 16];
        buffer[0..4].copy_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(matches!(
            parse_frame(&buffer),
            Err(ParseError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let data = encode_event_frame("assistantResponseEvent", br#"{"content":"hi"}"#);
        let (frame, consumed) = parse_frame(&data).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
        assert_eq!(frame.payload, br#"{"content":"hi"}"#);
    }

    #[test]
    fn test_frame_empty_headers_get_defaults() {
        let data = encode_frame(&[], b"{}");
        let (frame, _) = parse_frame(&data).unwrap().unwrap();
        assert_eq!(frame.message_type(), Some("event"));
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
    }

    #[test]
    fn test_frame_prelude_crc_mismatch() {
        let mut data = encode_event_frame("assistantResponseEvent", b"{}");
        data[8] ^= 0xFF;
        assert!(matches!(
            parse_frame(&data),
            Err(ParseError::PreludeCrcMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_message_crc_mismatch() {
        let mut data = encode_event_frame("assistantResponseEvent", br#"{"content":"x"}"#);
        let payload_pos = data.len() - 6;
        data[payload_pos] ^= 0x01;
        assert!(matches!(
            parse_frame(&data),
            Err(ParseError::MessageCrcMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_trailing_bytes_buffered() {
        // A valid frame followed by a truncated tail parses fully; the tail
        // is simply not consumed.
        let mut data = encode_event_frame("assistantResponseEvent", b"{}");
        let frame_len = data.len();
        data.extend_from_slice(&[1, 2, 3]);

        let (_, consumed) = parse_frame(&data).unwrap().unwrap();
        assert_eq!(consumed, frame_len);
    }

    #[test]
    fn test_parse_frame_exact_rejects_trailing() {
        let mut data = encode_event_frame("assistantResponseEvent", b"{}");
        assert!(parse_frame_exact(&data).is_ok());
        data.push(0);
        assert!(parse_frame_exact(&data).is_err());
    }

    #[test]
    fn test_probe_prelude() {
        let data = encode_event_frame("assistantResponseEvent", b"{}");
        assert_eq!(probe_prelude(&data), Some(data.len()));

        let mut corrupted = data.clone();
        corrupted[0] ^= 0x10;
        assert_eq!(probe_prelude(&corrupted), None);
    }
}
