//! Multiplexed log framing.
//!
//! The container daemon interleaves stdout and stderr on a single connection
//! by prefixing every payload with an 8-byte header: byte 0 selects the
//! stream, bytes 1-3 are reserved, bytes 4-7 carry the payload length as a
//! big-endian 32-bit integer. Chunk boundaries observed on the connection are
//! arbitrary, so a partial frame at the tail of a chunk is buffered and
//! completed by the next one. The demultiplexer never yields a half-frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::{Display, Error};

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Source stream of a single frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Client-visible stream name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    fn byte(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// A single demultiplexed frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Stream the frame belongs to.
    pub kind: StreamKind,

    /// Frame payload, exactly as produced by the daemon.
    pub payload: Bytes,
}

/// The daemon produced a header with an unknown stream id byte.
#[derive(Debug, Display, Error)]
#[display(fmt = "unknown stream id byte {}", _0)]
pub struct FramingError(#[error(not(source))] pub u8);

/// Incremental demultiplexer over arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: BytesMut,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FramingError> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();

        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Whether any buffered bytes remain undelivered.
    ///
    /// Leftover bytes at upstream EOF mean the daemon truncated a frame.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = StreamKind::from_byte(self.buf[0]).ok_or(FramingError(self.buf[0]))?;

        let length =
            u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);

        let payload = self.buf.split_to(length).freeze();

        Ok(Some(Frame { kind, payload }))
    }
}

/// Encode a single frame in the daemon's wire framing.
pub fn encode(kind: StreamKind, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());

    buf.put_u8(kind.byte());
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);

    buf.freeze()
}
