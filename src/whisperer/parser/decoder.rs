//! Streaming event decoder
//!
//! Turns an arbitrary chunking of the upstream byte stream into a sequence of
//! well-formed frames. Incoming bytes are staged in a fixed-capacity ring
//! buffer; decoding pulls complete frames out of the ring and resynchronises
//! on corruption when running lax.
//!
//! ## State Machine
//!
//! ```text
//! ┌─────────────────┐
//! │      Ready      │  (can receive data)
//! └────────┬────────┘
//!          │ decode() attempts to parse
//!          ↓
//! ┌─────────────────┐
//! │     Parsing     │
//! └────────┬────────┘
//!          │
//!     ┌────┴────────────┐
//!     ↓                 ↓
//!  [Success]         [Failure]
//!     │                 │
//!     ↓                 ├─> strict mode          → Stopped
//! ┌─────────┐           ├─> error_count reached  → Stopped
//! │  Ready  │           └─> otherwise: scan for next prelude → Recovering
//! └─────────┘
//! ```
//!
//! Recovery only ever advances the read cursor, so a frame that was emitted
//! once can never be emitted again.

use super::error::{ParseError, ParseResult};
use super::frame::{Frame, MAX_FRAME_SIZE, MIN_FRAME_SIZE, PRELUDE_SIZE, parse_frame, probe_prelude};
use super::ring::{DEFAULT_RING_CAPACITY, RingBuffer};

/// Default maximum cumulative recovery events before the stream is aborted
pub const DEFAULT_MAX_ERRORS: usize = 5;

/// Resynchronisation scan window
const RESYNC_WINDOW: usize = 1024;

/// Scan offset past which the scan step widens from 1 to 4 bytes
const RESYNC_STEP_THRESHOLD: usize = 256;

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Ready, can receive data
    Ready,
    /// Currently parsing a frame
    Parsing,
    /// Recovering (scanning past corrupted data)
    Recovering,
    /// Stopped (strict-mode failure or too many errors; terminal)
    Stopped,
}

/// Streaming frame decoder
///
/// # Example
///
/// ```rust,ignore
/// let mut decoder = EventStreamDecoder::new();
/// let (frames, fatal) = decoder.parse(chunk);
/// for frame in frames {
///     println!("{:?}", frame.event_type());
/// }
/// ```
pub struct EventStreamDecoder {
    /// Staging ring between network reads and frame decoding
    ring: RingBuffer,
    /// Reusable contiguous scratch for the frame being parsed
    scratch: Vec<u8>,
    state: DecoderState,
    /// CRC failures become stream-fatal when set
    strict: bool,
    frames_decoded: usize,
    /// Cumulative recovery events
    error_count: usize,
    max_errors: usize,
    bytes_skipped: usize,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    /// Create a lax-mode decoder with default limits
    pub fn new() -> Self {
        Self::with_config(false, DEFAULT_MAX_ERRORS, DEFAULT_RING_CAPACITY)
    }

    /// Create a decoder with explicit posture and limits
    pub fn with_config(strict: bool, max_errors: usize, capacity: usize) -> Self {
        Self {
            ring: RingBuffer::with_capacity(capacity),
            scratch: Vec::new(),
            state: DecoderState::Ready,
            strict,
            frames_decoded: 0,
            error_count: 0,
            max_errors,
            bytes_skipped: 0,
        }
    }

    /// Feed bytes into the staging ring.
    ///
    /// Returns the number of bytes accepted; a short write means the ring is
    /// full and the caller must `decode` before feeding the remainder.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let written = self.ring.try_write(data);
        if written > 0 && self.state == DecoderState::Recovering {
            self.state = DecoderState::Ready;
        }
        written
    }

    /// Decode every frame currently available from `data` plus buffered bytes.
    ///
    /// Recoverable damage is logged and skipped (lax mode); the returned error
    /// is stream-fatal. Frames decoded before the fatal error are still
    /// returned and must be delivered.
    pub fn parse(&mut self, data: &[u8]) -> (Vec<Frame>, Option<ParseError>) {
        let mut frames = Vec::new();
        let mut offset = 0;

        loop {
            offset += self.feed(&data[offset..]);

            loop {
                match self.decode() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) if self.is_stopped() => return (frames, Some(e)),
                    Err(e) => {
                        tracing::warn!("recoverable decode error: {}", e);
                    }
                }
            }

            if offset >= data.len() {
                return (frames, None);
            }

            if self.ring.free() == 0 {
                // No frame completed and the ring cannot absorb more input
                self.state = DecoderState::Stopped;
                return (
                    frames,
                    Some(ParseError::BufferOverflow {
                        size: self.ring.available() + (data.len() - offset),
                        max: self.ring.capacity(),
                    }),
                );
            }
        }
    }

    /// Try to decode the next frame from the staging ring.
    ///
    /// # Returns
    /// - `Ok(Some(frame))` - successfully decoded a frame
    /// - `Ok(None)` - insufficient data, need more bytes
    /// - `Err(e)` - decode error (recoverable unless the decoder stopped)
    pub fn decode(&mut self) -> ParseResult<Option<Frame>> {
        if self.state == DecoderState::Stopped {
            return Err(ParseError::TooManyErrors {
                count: self.error_count,
                last_error: "decoder stopped".to_string(),
            });
        }

        if self.ring.available() < MIN_FRAME_SIZE {
            self.state = DecoderState::Ready;
            return Ok(None);
        }

        self.state = DecoderState::Parsing;

        // Length sanity from the prelude alone, before committing to a copy
        let mut prelude = [0u8; PRELUDE_SIZE];
        self.ring.peek(&mut prelude);
        let total_length = u32::from_be_bytes([prelude[0], prelude[1], prelude[2], prelude[3]]);

        if total_length < MIN_FRAME_SIZE as u32 {
            return self.fail(ParseError::MessageTooSmall {
                length: total_length,
                min: MIN_FRAME_SIZE as u32,
            });
        }
        if total_length > MAX_FRAME_SIZE {
            return self.fail(ParseError::MessageTooLarge {
                length: total_length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_length = total_length as usize;
        if self.ring.available() < total_length {
            self.state = DecoderState::Ready;
            return Ok(None);
        }

        self.scratch.resize(total_length, 0);
        self.ring.peek(&mut self.scratch);

        match parse_frame(&self.scratch) {
            Ok(Some((frame, consumed))) => {
                self.ring.skip(consumed);
                self.state = DecoderState::Ready;
                self.frames_decoded += 1;
                Ok(Some(frame))
            }
            Ok(None) => {
                // Unreachable given the length check above, but do not spin
                self.state = DecoderState::Ready;
                Ok(None)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Create a decode iterator draining all currently parsable frames
    pub fn decode_iter(&mut self) -> DecodeIter<'_> {
        DecodeIter { decoder: self }
    }

    /// Apply the error policy for a validation failure.
    ///
    /// Strict mode stops the stream outright. Lax mode counts the event,
    /// resynchronises, and stops only once the cumulative cap is reached.
    fn fail(&mut self, error: ParseError) -> ParseResult<Option<Frame>> {
        if self.strict {
            self.state = DecoderState::Stopped;
            tracing::error!("strict mode decode failure: {}", error);
            return Err(error);
        }

        self.error_count += 1;
        if self.error_count >= self.max_errors {
            self.state = DecoderState::Stopped;
            tracing::error!(
                "decoder stopped after {} recovery events, last error: {}",
                self.error_count,
                error
            );
            return Err(ParseError::TooManyErrors {
                count: self.error_count,
                last_error: error.to_string(),
            });
        }

        self.resynchronize(&error);
        self.state = DecoderState::Recovering;
        Err(error)
    }

    /// Scan forward for the next candidate prelude whose CRC verifies.
    ///
    /// The scan starts at offset 1 (or 4 for oversized-length failures, so a
    /// hostile length field cannot pin the cursor) and widens its step from 1
    /// to 4 bytes past a threshold to cap worst-case CPU. If no candidate is
    /// found within the window, the whole scanned region is dropped.
    fn resynchronize(&mut self, error: &ParseError) {
        let min_skip = match error {
            ParseError::MessageTooLarge { .. } => 4,
            _ => 1,
        };

        let scannable = self.ring.available().saturating_sub(PRELUDE_SIZE);
        let window = scannable.min(RESYNC_WINDOW);
        let mut probe = [0u8; PRELUDE_SIZE];

        let mut offset = min_skip;
        while offset <= window {
            if self.ring.peek_at(offset, &mut probe) == PRELUDE_SIZE
                && probe_prelude(&probe).is_some()
            {
                self.ring.skip(offset);
                self.bytes_skipped += offset;
                tracing::warn!(
                    "resynchronised after {} skipped bytes (total skipped {})",
                    offset,
                    self.bytes_skipped
                );
                return;
            }
            offset += if offset < RESYNC_STEP_THRESHOLD { 1 } else { 4 };
        }

        // Nothing plausible in the window; drop it and wait for more data
        let dropped = self.ring.skip(window.max(min_skip));
        self.bytes_skipped += dropped;
        tracing::warn!(
            "no frame boundary within scan window, dropped {} bytes (total skipped {})",
            dropped,
            self.bytes_skipped
        );
    }

    // ==================== Lifecycle management ====================

    /// Reset the decoder to its initial state, discarding buffered bytes
    pub fn reset(&mut self) {
        self.ring.reset();
        self.scratch.clear();
        self.state = DecoderState::Ready;
        self.frames_decoded = 0;
        self.error_count = 0;
        self.bytes_skipped = 0;
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == DecoderState::Ready
    }

    pub fn is_stopped(&self) -> bool {
        self.state == DecoderState::Stopped
    }

    pub fn is_recovering(&self) -> bool {
        self.state == DecoderState::Recovering
    }

    /// Number of frames decoded so far
    pub fn frames_decoded(&self) -> usize {
        self.frames_decoded
    }

    /// Cumulative recovery events
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Bytes dropped during resynchronisation
    pub fn bytes_skipped(&self) -> usize {
        self.bytes_skipped
    }

    /// Bytes currently staged in the ring
    pub fn buffered(&self) -> usize {
        self.ring.available()
    }
}

/// Iterator over frames currently decodable
pub struct DecodeIter<'a> {
    decoder: &'a mut EventStreamDecoder,
}

impl Iterator for DecodeIter<'_> {
    type Item = ParseResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.decoder.state {
            DecoderState::Stopped | DecoderState::Recovering => return None,
            _ => {}
        }

        match self.decoder.decode() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
