//! [`FrameDecoder`] – splits a device byte stream into [`Frame`]s.
//!
//! Devices send flat JSON objects separated by the literal delimiter `**`.
//! Whitespace anywhere in a frame is stripped before decoding, and empty
//! frames are skipped silently.
//!
//! The decoder is stateful per connection.  After each read:
//!
//! * every delimiter-terminated segment is handed out,
//! * the undelimited tail is handed out as soon as it forms a complete
//!   object, kept for the next read while it is merely incomplete, and
//!   handed out (to fail decoding) once it can no longer become valid.
//!
//! A JSON value that itself contains `**` is split like any other; the wire
//! protocol has no escaping.

use smartpower_types::{DEVICE_ID_FIELD, DeviceMessage, GatewayError, MESSAGE_FIELD};

/// Separator between frames on the device wire.
pub const FRAME_DELIMITER_STR: &str = "**";
pub const FRAME_DELIMITER: &[u8] = FRAME_DELIMITER_STR.as_bytes();

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame after whitespace removal.  This is what gets published.
    pub text: String,
    pub message: DeviceMessage,
}

impl Frame {
    pub fn device_id(&self) -> &str {
        self.message.device_id().unwrap_or_default()
    }
}

/// Remove every whitespace character from `raw`.
pub fn normalize(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Decode one normalized frame.  Both `DeviceID` and `Message` must be
/// present.
pub fn decode_frame(text: String) -> Result<Frame, GatewayError> {
    let message = DeviceMessage::parse(&text)?;
    message.require(DEVICE_ID_FIELD)?;
    message.require(MESSAGE_FIELD)?;
    Ok(Frame { text, message })
}

/// Split a complete buffer on [`FRAME_DELIMITER`] without retaining anything.
pub fn split_frames(buf: &[u8]) -> Frames {
    let (mut candidates, tail) = split_delimited(buf);
    candidates.push(tail.to_vec());
    Frames::new(candidates, None)
}

// ────────────────────────────────────────────────────────────────────────────
// FrameDecoder
// ────────────────────────────────────────────────────────────────────────────

/// Per-connection reassembly buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Append `chunk` and return every frame that is ready.
    ///
    /// If the retained tail grows past `max_frame_bytes` it is discarded and
    /// [`Frames::overflow`] reports the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Frames {
        self.pending.extend_from_slice(chunk);
        let buffered = std::mem::take(&mut self.pending);
        let (mut candidates, tail) = split_delimited(&buffered);

        let mut overflow = None;
        match classify_tail(tail) {
            TailState::Empty => {}
            TailState::Ready => candidates.push(tail.to_vec()),
            TailState::Incomplete if tail.len() > self.max_frame_bytes => {
                overflow = Some(self.max_frame_bytes);
            }
            TailState::Incomplete => self.pending = tail.to_vec(),
        }
        Frames::new(candidates, overflow)
    }

    /// Flush whatever is still buffered.  Called at end of stream.
    pub fn finish(&mut self) -> Frames {
        let tail = std::mem::take(&mut self.pending);
        Frames::new(vec![tail], None)
    }

    /// Number of bytes held back waiting for more input.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frames
// ────────────────────────────────────────────────────────────────────────────

/// Lazy, single-pass sequence of decode results for one read.
///
/// Candidates are only decoded as the iterator advances, so a caller that
/// stops early never pays for (or reports errors from) the rest.
#[derive(Debug)]
pub struct Frames {
    candidates: std::vec::IntoIter<Vec<u8>>,
    overflow: Option<usize>,
}

impl Frames {
    fn new(candidates: Vec<Vec<u8>>, overflow: Option<usize>) -> Self {
        Self {
            candidates: candidates.into_iter(),
            overflow,
        }
    }

    /// `Some(limit)` when this read pushed the undelimited tail past the
    /// decoder's limit.
    pub fn overflow(&self) -> Option<usize> {
        self.overflow
    }
}

impl Iterator for Frames {
    type Item = Result<Frame, GatewayError>;

    fn next(&mut self) -> Option<Self::Item> {
        for raw in self.candidates.by_ref() {
            if let Some(result) = decode_candidate(&raw) {
                return Some(result);
            }
        }
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ────────────────────────────────────────────────────────────────────────────

enum TailState {
    /// Nothing but whitespace.
    Empty,
    /// Decodes now, or never will.
    Ready,
    /// Could still become a valid frame with more bytes.
    Incomplete,
}

fn decode_candidate(raw: &[u8]) -> Option<Result<Frame, GatewayError>> {
    let text = match std::str::from_utf8(raw) {
        Ok(s) => normalize(s),
        Err(e) => {
            return Some(Err(GatewayError::FrameDecode {
                raw: String::from_utf8_lossy(raw).into_owned(),
                reason: e.to_string(),
            }));
        }
    };
    if text.is_empty() {
        return None;
    }
    Some(decode_frame(text))
}

fn classify_tail(tail: &[u8]) -> TailState {
    if ends_with_partial_delimiter(tail) {
        return TailState::Incomplete;
    }
    let text = match std::str::from_utf8(tail) {
        Ok(s) => normalize(s),
        // A multi-byte character cut off by the read boundary.
        Err(e) if e.error_len().is_none() => return TailState::Incomplete,
        Err(_) => return TailState::Ready,
    };
    if text.is_empty() {
        return TailState::Empty;
    }
    match DeviceMessage::from_json_str(&text) {
        Ok(_) => TailState::Ready,
        Err(e) if e.is_eof() => TailState::Incomplete,
        Err(_) => TailState::Ready,
    }
}

fn ends_with_partial_delimiter(buf: &[u8]) -> bool {
    (1..FRAME_DELIMITER.len()).any(|k| buf.ends_with(&FRAME_DELIMITER[..k]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split `buf` into delimiter-terminated segments plus the undelimited tail.
fn split_delimited(buf: &[u8]) -> (Vec<Vec<u8>>, &[u8]) {
    let mut segments = Vec::new();
    let mut rest = buf;
    while let Some(i) = find(rest, FRAME_DELIMITER) {
        segments.push(rest[..i].to_vec());
        rest = &rest[i + FRAME_DELIMITER.len()..];
    }
    (segments, rest)
}
