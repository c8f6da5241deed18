//! Wire framing for tasks and reports.
//!
//! Every task and report crosses the broker/backend boundary as a single
//! byte blob: a header prefix (task ID, function name, marshaller ID)
//! followed by a length-prefixed sequence of opaque chunks. The header
//! encoding is marshaller-independent so any component — including a
//! broker that routes by function name — can read it without knowing the
//! payload format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! u16 id_len    | id bytes (UTF-8)
//! u16 name_len  | name bytes (UTF-8)
//! u16 marshaller id
//! u32 chunk count
//! per chunk: u32 len | chunk bytes
//! ```
//!
//! `decompose_bytes(compose_bytes(h, xs)) == (h, xs)` holds byte-exactly.
//! Any trailing bytes after the last chunk are a [`FrameError::MalformedFrame`].

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Errors produced by the frame codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame does not match the expected layout.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A string or chunk exceeds its length-prefix range.
    #[error("frame field too large: {0}")]
    FieldTooLarge(&'static str),
}

/// Immutable descriptor carried with every task and report.
///
/// The ID is assigned once, at task composition, and never changes; a
/// report always carries the ID and name of the originating task. The
/// marshaller ID selects the encoder/decoder for the payload chunks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    id: String,
    name: String,
    marshaller: u16,
}

impl Header {
    /// Creates a header for the given task identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, marshaller: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            marshaller,
        }
    }

    /// The task's unique, opaque identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The registered function name this task or report belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The marshaller ID selecting the payload codec.
    pub fn marshaller(&self) -> u16 {
        self.marshaller
    }

    /// Returns the same identity bound to a different marshaller ID.
    ///
    /// Workers use this to build report headers: reports keep the task's
    /// ID and name but are framed with the report-side marshaller.
    pub fn with_marshaller(&self, marshaller: u16) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            marshaller,
        }
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// Serializes a header plus a sequence of opaque chunks into one frame.
pub fn compose_bytes(header: &Header, chunks: &[Vec<u8>]) -> Result<Vec<u8>, FrameError> {
    let id = header.id.as_bytes();
    let name = header.name.as_bytes();
    if id.len() > u16::MAX as usize {
        return Err(FrameError::FieldTooLarge("task id"));
    }
    if name.len() > u16::MAX as usize {
        return Err(FrameError::FieldTooLarge("function name"));
    }
    if chunks.len() > u32::MAX as usize {
        return Err(FrameError::FieldTooLarge("chunk count"));
    }

    let payload: usize = chunks.iter().map(|c| c.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(id.len() + name.len() + 10 + payload);

    buf.put_u16_le(id.len() as u16);
    buf.put_slice(id);
    buf.put_u16_le(name.len() as u16);
    buf.put_slice(name);
    buf.put_u16_le(header.marshaller);
    buf.put_u32_le(chunks.len() as u32);
    for chunk in chunks {
        if chunk.len() > u32::MAX as usize {
            return Err(FrameError::FieldTooLarge("chunk"));
        }
        buf.put_u32_le(chunk.len() as u32);
        buf.put_slice(chunk);
    }

    Ok(buf.to_vec())
}

/// Splits a frame back into its header and chunk sequence.
///
/// Fails with [`FrameError::MalformedFrame`] on truncation or trailing
/// bytes after the last chunk.
pub fn decompose_bytes(frame: &[u8]) -> Result<(Header, Vec<Vec<u8>>), FrameError> {
    let mut buf = frame;
    let header = read_header(&mut buf)?;

    if buf.remaining() < 4 {
        return Err(FrameError::MalformedFrame("truncated chunk count"));
    }
    let count = buf.get_u32_le() as usize;
    let mut chunks = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(FrameError::MalformedFrame("truncated chunk length"));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(FrameError::MalformedFrame("truncated chunk"));
        }
        chunks.push(buf[..len].to_vec());
        buf.advance(len);
    }

    if buf.has_remaining() {
        return Err(FrameError::MalformedFrame("trailing bytes"));
    }

    Ok((header, chunks))
}

/// Reads just the header prefix of a frame, ignoring the chunks.
///
/// Used by components that route on identity without decoding payloads,
/// such as a broker dispatching frames to per-name listeners.
pub fn peek_header(frame: &[u8]) -> Result<Header, FrameError> {
    let mut buf = frame;
    read_header(&mut buf)
}

fn read_header(buf: &mut &[u8]) -> Result<Header, FrameError> {
    let id = read_string(buf, "task id")?;
    let name = read_string(buf, "function name")?;
    if buf.remaining() < 2 {
        return Err(FrameError::MalformedFrame("truncated marshaller id"));
    }
    let marshaller = buf.get_u16_le();
    Ok(Header {
        id,
        name,
        marshaller,
    })
}

fn read_string(buf: &mut &[u8], what: &'static str) -> Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::MalformedFrame(what));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(FrameError::MalformedFrame(what));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| FrameError::MalformedFrame(what))?
        .to_string();
    buf.advance(len);
    Ok(s)
}
