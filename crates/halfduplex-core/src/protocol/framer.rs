//! Line framing
//!
//! Turns the raw byte stream of a transport into delimiter-terminated lines.
//! The framer knows nothing about requests; it only splits bytes.

use bytes::{Buf, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use super::{ProtocolError, DEFAULT_DELIMITER};

/// A received line, delimiter stripped
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Line(Bytes);

impl Line {
    /// Wrap raw bytes as a line
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Raw bytes of the line
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the line, returning its bytes
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Decode as UTF-8, replacing invalid sequences
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl Deref for Line {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Line {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Line {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Line {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl PartialEq<[u8]> for Line {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl PartialEq<&[u8]> for Line {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_bytes() == *other
    }
}

impl PartialEq<&str> for Line {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line(\"{}\")", self.0.escape_ascii())
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// Decoder splitting a byte stream on a configurable delimiter.
///
/// Bytes before a complete delimiter stay buffered until the delimiter
/// arrives. Consecutive delimiters produce no empty lines, and an
/// unterminated tail at end of stream is dropped.
#[derive(Debug, Clone)]
pub struct LineCodec {
    delimiter: Vec<u8>,
    /// Buffer offset where the next delimiter search starts
    next_index: usize,
}

impl LineCodec {
    /// Create a codec for the given delimiter (must not be empty)
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(ProtocolError::InvalidConfig(
                "line delimiter must not be empty".to_string(),
            ));
        }
        Ok(Self {
            delimiter,
            next_index: 0,
        })
    }

    /// The delimiter this codec splits on
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_vec(),
            next_index: 0,
        }
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, ProtocolError> {
        loop {
            let start = self.next_index.min(buf.len());
            let Some(offset) = find_delimiter(&buf[start..], &self.delimiter) else {
                // Keep the last delimiter.len() - 1 bytes searchable, the
                // delimiter may be split across two reads.
                self.next_index = buf.len().saturating_sub(self.delimiter.len() - 1);
                return Ok(None);
            };

            let line = buf.split_to(start + offset).freeze();
            buf.advance(self.delimiter.len());
            self.next_index = 0;

            if !line.is_empty() {
                return Ok(Some(Line(line)));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, ProtocolError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if !buf.is_empty() {
            tracing::debug!(
                bytes = buf.len(),
                "dropping unterminated line at end of stream"
            );
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    haystack
        .windows(delimiter.len())
        .position(|window| window == delimiter)
}

/// Lazy stream of lines read from `reader`
pub type LineStream<R> = FramedRead<R, LineCodec>;

/// Frame a raw byte stream into lines.
///
/// The stream is not restartable and ends only when `reader` reaches EOF.
pub fn frame_lines<R: AsyncRead>(reader: R, codec: LineCodec) -> LineStream<R> {
    FramedRead::new(reader, codec)
}
