//! Line-oriented framing: locate `\n` boundaries in a byte stream, retaining
//! any partial tail across reads (§4.1).

/// Maximum framed record length. Longer frames are a protocol error.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Classification of a decode failure, used to tag the "drop" counter with a
/// reason (§4.1, §7 `protocol_error`).
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    /// The line was not valid UTF-8.
    InvalidUtf8,
    /// The line was not valid JSON.
    MalformedJson(String),
    /// `type` did not match a known [`crate::RecordKind`].
    UnknownKind(String),
    /// `v` is greater than [`crate::SCHEMA_VERSION`].
    UnsupportedVersion(u32),
    /// A required field was absent or empty.
    MissingField(&'static str),
    /// The line was empty after trimming whitespace.
    Empty,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidUtf8 => write!(f, "frame is not valid UTF-8"),
            FrameError::MalformedJson(e) => write!(f, "malformed JSON: {e}"),
            FrameError::UnknownKind(k) => write!(f, "unknown record kind: {k}"),
            FrameError::UnsupportedVersion(v) => write!(f, "unsupported schema version: {v}"),
            FrameError::MissingField(name) => write!(f, "missing required field: {name}"),
            FrameError::Empty => write!(f, "empty frame"),
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameError {
    /// Short, stable reason tag for metrics (`records_dropped_total{reason}`).
    pub fn reason_tag(&self) -> &'static str {
        match self {
            FrameError::InvalidUtf8 => "invalid_utf8",
            FrameError::MalformedJson(_) => "malformed_json",
            FrameError::UnknownKind(_) => "unknown_kind",
            FrameError::UnsupportedVersion(_) => "unsupported_version",
            FrameError::MissingField(_) => "missing_field",
            FrameError::Empty => "empty",
        }
    }
}

/// One event produced by [`FrameReader::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete line, with the trailing `\n` stripped.
    Line(Vec<u8>),
    /// A frame exceeded [`MAX_FRAME_LEN`] before a `\n` was found; it has
    /// been discarded. The caller should close the connection (§4.1).
    Oversize,
}

/// Incremental line framer fed raw bytes as they arrive off a socket.
///
/// Retains a partial tail across calls to [`FrameReader::push`] so callers
/// never need to reassemble frames split across TCP reads themselves.
pub struct FrameReader {
    buf: Vec<u8>,
    max_len: usize,
    /// Set once the current (undelimited) frame has already exceeded
    /// `max_len`; further bytes are discarded until the next `\n` resyncs.
    discarding: bool,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        FrameReader {
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Feed newly-read bytes, returning every frame event they complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                // No full line yet. If what we're holding has already blown
                // the budget, switch to discard mode so we don't keep every
                // byte of an oversize frame in memory.
                if !self.discarding && self.buf.len() > self.max_len {
                    self.discarding = true;
                    self.buf.clear();
                }
                break;
            };

            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];

            if self.discarding {
                self.discarding = false;
                events.push(FrameEvent::Oversize);
            } else if line.len() > self.max_len {
                events.push(FrameEvent::Oversize);
            } else {
                events.push(FrameEvent::Line(line.to_vec()));
            }
        }

        events
    }
}
