//! Content-Length message framing over a byte-stream transport.
//!
//! The transport only moves bytes; this layer demarcates discrete messages.
//! Framing is HTTP-style, the same as the Language Server Protocol:
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! The header parsing is case-insensitive and handles both CRLF and LF line
//! endings. Bodies are opaque bytes and are never interpreted here.

use thiserror::Error;
use tracing::trace;

use crate::ipc::client::{Transport, TransportError};

/// Default maximum message size (100MB) to prevent OOM from a buggy engine.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Longest header line accepted before giving up on the stream.
const MAX_HEADER_LINE: usize = 8 * 1024;

/// Bytes requested from the transport per fill.
const READ_CHUNK: usize = 8 * 1024;

/// Framing error types.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Header line exceeds {0} bytes")]
    HeaderTooLong(usize),

    #[error("Header is not valid UTF-8")]
    InvalidHeader,

    /// The peer shut down in the middle of a frame.
    #[error("Connection closed mid-frame")]
    Truncated,
}

/// Encode `body` as a single framed buffer, header included.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// A transport with Content-Length framing on both directions.
///
/// Bytes that arrive past the end of one frame are kept for the next, so
/// short and coalesced reads are both handled.
///
/// # Example
///
/// ```ignore
/// let mut framed = Framed::new(client);
/// framed.write_frame(&request)?;
/// match framed.read_frame()? {
///     Some(reply) => handle(reply),
///     None => println!("engine went away"),
/// }
/// ```
#[derive(Debug)]
pub struct Framed<T> {
    transport: T,
    buf: Vec<u8>,
    /// Start of unconsumed bytes in `buf`.
    pos: usize,
    max_frame_size: usize,
}

impl<T: Transport> Framed<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buf: Vec::new(),
            pos: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Limit applied to both incoming and outgoing bodies.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Unwrap the transport. Buffered bytes not yet returned are dropped.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Write one frame. Header and body go out in a single `write_all`, so a
    /// failure never leaves a torn frame behind a success.
    pub fn write_frame(&mut self, body: &[u8]) -> Result<(), FrameError> {
        if body.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        self.transport.write_all(&encode_frame(body))?;
        trace!(bytes = body.len(), "wrote frame");
        Ok(())
    }

    /// Read one frame.
    ///
    /// # Protocol
    ///
    /// 1. Read headers until an empty line (handles both CRLF and LF)
    /// 2. Extract Content-Length header (case-insensitive)
    /// 3. Read exactly that many bytes for the body
    ///
    /// Returns `Ok(None)` when the peer shut down cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The transport fails
    /// - The stream ends inside a frame
    /// - No valid Content-Length header is found
    /// - Content-Length exceeds the configured maximum
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut at_boundary = true;

        loop {
            let line = match self.next_line()? {
                Some(line) => line,
                None if at_boundary => return Ok(None),
                None => return Err(FrameError::Truncated),
            };
            at_boundary = false;

            let line = std::str::from_utf8(&line).map_err(|_| FrameError::InvalidHeader)?;
            let trimmed = line.trim();

            // Empty line signals end of headers
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':') {
                if key.trim().eq_ignore_ascii_case("Content-Length") {
                    let value = value.trim();
                    content_length = Some(
                        value
                            .parse()
                            .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?,
                    );
                }
                // Ignore other headers (e.g., Content-Type)
            }
        }

        let size = content_length.ok_or(FrameError::MissingContentLength)?;
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let body = self.take_exact(size)?;
        trace!(bytes = size, "read frame");
        Ok(Some(body))
    }

    /// Next `\n`-terminated line, terminator included. `None` on EOF with
    /// nothing buffered.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        // Relative to `pos`, which `fill` may rebase.
        let mut scanned = 0;
        loop {
            let start = self.pos + scanned;
            if let Some(i) = self.buf[start..].iter().position(|&b| b == b'\n') {
                let end = start + i + 1;
                let line = self.buf[self.pos..end].to_vec();
                self.consume(end);
                return Ok(Some(line));
            }
            scanned = self.buf.len() - self.pos;

            if self.buf.len() - self.pos > MAX_HEADER_LINE {
                return Err(FrameError::HeaderTooLong(MAX_HEADER_LINE));
            }
            if self.fill()? == 0 {
                return if self.pos == self.buf.len() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
        }
    }

    fn take_exact(&mut self, size: usize) -> Result<Vec<u8>, FrameError> {
        while self.buf.len() - self.pos < size {
            if self.fill()? == 0 {
                return Err(FrameError::Truncated);
            }
        }
        let end = self.pos + size;
        let body = self.buf[self.pos..end].to_vec();
        self.consume(end);
        Ok(body)
    }

    fn consume(&mut self, end: usize) {
        self.pos = end;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Append one transport read to the buffer. Returns the byte count.
    fn fill(&mut self) -> Result<usize, FrameError> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + READ_CHUNK, 0);
        match self.transport.read(&mut self.buf[old_len..]) {
            Ok(n) => {
                self.buf.truncate(old_len + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(old_len);
                Err(e.into())
            }
        }
    }
}
