//! Event-stream header parsing
//!
//! Each header is encoded as `name_len (u8) | name | value_type (u8) | value`.
//! Well-known header names start with `:` (`:message-type`, `:event-type`,
//! `:content-type`, `:exception-type`, `:error-code`).

use super::error::{ParseError, ParseResult};
use std::collections::HashMap;

/// Header value type identifier
///
/// The 10 value types defined by the event-stream protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderValueType {
    BoolTrue = 0,
    BoolFalse = 1,
    Byte = 2,
    Short = 3,
    Integer = 4,
    Long = 5,
    ByteArray = 6,
    String = 7,
    Timestamp = 8,
    Uuid = 9,
}

impl TryFrom<u8> for HeaderValueType {
    type Error = ParseError;

    fn try_from(value: u8) -> ParseResult<Self> {
        match value {
            0 => Ok(Self::BoolTrue),
            1 => Ok(Self::BoolFalse),
            2 => Ok(Self::Byte),
            3 => Ok(Self::Short),
            4 => Ok(Self::Integer),
            5 => Ok(Self::Long),
            6 => Ok(Self::ByteArray),
            7 => Ok(Self::String),
            8 => Ok(Self::Timestamp),
            9 => Ok(Self::Uuid),
            _ => Err(ParseError::InvalidHeaderType(value)),
        }
    }
}

/// Header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    ByteArray(Vec<u8>),
    String(String),
    /// Milliseconds since epoch
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Message header collection
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: HashMap<String, HeaderValue>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    /// Default header set assumed for frames with an empty header section
    pub fn with_defaults() -> Self {
        let mut headers = Self::new();
        headers.fill_defaults();
        headers
    }

    /// Fill in the well-known `:` keys that are missing
    pub fn fill_defaults(&mut self) {
        for (name, value) in [
            (":message-type", "event"),
            (":event-type", "assistantResponseEvent"),
            (":content-type", "application/json"),
        ] {
            self.inner
                .entry(name.to_string())
                .or_insert_with(|| HeaderValue::String(value.to_string()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn insert(&mut self, name: String, value: HeaderValue) {
        self.inner.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.inner.get(name)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    /// Get message type (:message-type)
    pub fn message_type(&self) -> Option<&str> {
        self.get_string(":message-type")
    }

    /// Get event type (:event-type)
    pub fn event_type(&self) -> Option<&str> {
        self.get_string(":event-type")
    }

    /// Get content type (:content-type)
    pub fn content_type(&self) -> Option<&str> {
        self.get_string(":content-type")
    }

    /// Get exception type (:exception-type)
    pub fn exception_type(&self) -> Option<&str> {
        self.get_string(":exception-type")
    }

    /// Get error code (:error-code)
    pub fn error_code(&self) -> Option<&str> {
        self.get_string(":error-code")
    }
}

/// Parse all headers from a header section.
///
/// Strict variant: any malformed header fails the whole section.
pub fn parse_headers(data: &[u8]) -> ParseResult<Headers> {
    match parse_headers_inner(data) {
        (headers, None) => Ok(headers),
        (_, Some(e)) => Err(e),
    }
}

/// Parse headers, salvaging a partially-decoded set.
///
/// If at least one header decoded before the error, the set is force-completed
/// by filling defaults for the well-known `:` keys and the error is returned
/// alongside for logging. An error on the very first header is unsalvageable.
pub fn parse_headers_lossy(data: &[u8]) -> ParseResult<(Headers, Option<ParseError>)> {
    match parse_headers_inner(data) {
        (headers, None) => Ok((headers, None)),
        (mut headers, Some(e)) if !headers.is_empty() => {
            headers.fill_defaults();
            Ok((headers, Some(e)))
        }
        (_, Some(e)) => Err(e),
    }
}

fn parse_headers_inner(data: &[u8]) -> (Headers, Option<ParseError>) {
    let mut headers = Headers::new();
    let mut offset = 0;

    while offset < data.len() {
        // Header name length (1 byte)
        let name_len = data[offset] as usize;
        offset += 1;

        if name_len == 0 {
            return (
                headers,
                Some(ParseError::HeaderParseFailed(
                    "header name length cannot be 0".to_string(),
                )),
            );
        }

        if offset + name_len > data.len() {
            return (
                headers,
                Some(ParseError::Incomplete {
                    needed: name_len,
                    available: data.len() - offset,
                }),
            );
        }
        let name = String::from_utf8_lossy(&data[offset..offset + name_len]).to_string();
        offset += name_len;

        // Value type tag (1 byte)
        if offset >= data.len() {
            return (
                headers,
                Some(ParseError::Incomplete {
                    needed: 1,
                    available: 0,
                }),
            );
        }
        let value_type = match HeaderValueType::try_from(data[offset]) {
            Ok(t) => t,
            Err(e) => return (headers, Some(e)),
        };
        offset += 1;

        match parse_header_value(&data[offset..], value_type) {
            Ok((value, consumed)) => {
                offset += consumed;
                headers.insert(name, value);
            }
            Err(e) => return (headers, Some(e)),
        }
    }

    (headers, None)
}

/// Parse one header value, returning it and the number of bytes consumed
fn parse_header_value(data: &[u8], value_type: HeaderValueType) -> ParseResult<(HeaderValue, usize)> {
    match value_type {
        HeaderValueType::BoolTrue => Ok((HeaderValue::Bool(true), 0)),
        HeaderValueType::BoolFalse => Ok((HeaderValue::Bool(false), 0)),
        HeaderValueType::Byte => {
            ensure_bytes(data, 1)?;
            Ok((HeaderValue::Byte(data[0] as i8), 1))
        }
        HeaderValueType::Short => {
            ensure_bytes(data, 2)?;
            Ok((HeaderValue::Short(i16::from_be_bytes([data[0], data[1]])), 2))
        }
        HeaderValueType::Integer => {
            ensure_bytes(data, 4)?;
            let v = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            Ok((HeaderValue::Integer(v), 4))
        }
        HeaderValueType::Long => {
            ensure_bytes(data, 8)?;
            let v = i64::from_be_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]);
            Ok((HeaderValue::Long(v), 8))
        }
        HeaderValueType::Timestamp => {
            ensure_bytes(data, 8)?;
            let v = i64::from_be_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ]);
            Ok((HeaderValue::Timestamp(v), 8))
        }
        HeaderValueType::ByteArray => {
            ensure_bytes(data, 2)?;
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            ensure_bytes(data, 2 + len)?;
            Ok((HeaderValue::ByteArray(data[2..2 + len].to_vec()), 2 + len))
        }
        HeaderValueType::String => {
            ensure_bytes(data, 2)?;
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            ensure_bytes(data, 2 + len)?;
            let v = String::from_utf8_lossy(&data[2..2 + len]).to_string();
            Ok((HeaderValue::String(v), 2 + len))
        }
        HeaderValueType::Uuid => {
            ensure_bytes(data, 16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&data[..16]);
            Ok((HeaderValue::Uuid(uuid), 16))
        }
    }
}

fn ensure_bytes(data: &[u8], needed: usize) -> ParseResult<()> {
    if data.len() < needed {
        Err(ParseError::Incomplete {
            needed,
            available: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Encode one header (test and fixture support)
#[cfg(test)]
pub fn encode_string_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(HeaderValueType::String as u8);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}
