//! Connection framing.

use crate::{DecodeError, P2pError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"HRDF";

/// Header length: magic (4) | kind (1) | length (4).
pub const FRAME_HEADER_LEN: usize = 9;

/// Maximum frame body size (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the chunks file payloads are split into (1 MiB).
pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// An encoded control message.
    Message = 1,
    /// A chunk of raw file payload.
    Stream = 2,
}

impl FrameKind {
    /// Parse a frame kind from a byte.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Message),
            2 => Some(Self::Stream),
            _ => None,
        }
    }
}

/// A unit of data on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame kind.
    pub kind: FrameKind,
    /// The frame body.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a control message frame.
    #[must_use]
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Message,
            payload: payload.into(),
        }
    }

    /// Creates a raw payload frame.
    #[must_use]
    pub fn stream(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Stream,
            payload: payload.into(),
        }
    }

    /// Encodes the frame to bytes.
    ///
    /// Format:
    /// - 4 bytes: magic
    /// - 1 byte: frame kind
    /// - 4 bytes: body length (big-endian)
    /// - N bytes: body
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<Bytes> {
        let len = self.payload.len();
        if len > MAX_FRAME_SIZE {
            return Err(P2pError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + len);
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u32(len as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Splits a file payload into stream frames of at most
    /// [`STREAM_CHUNK_SIZE`] bytes. An empty payload yields no frames.
    pub fn stream_chunks(data: &Bytes) -> impl Iterator<Item = Frame> + '_ {
        (0..data.len())
            .step_by(STREAM_CHUNK_SIZE)
            .map(move |start| {
                let end = (start + STREAM_CHUNK_SIZE).min(data.len());
                Frame::stream(data.slice(start..end))
            })
    }
}

/// Parses a frame header into its raw kind byte and body length.
pub(crate) fn parse_header(header: &[u8; FRAME_HEADER_LEN]) -> std::result::Result<(u8, usize), DecodeError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if magic != FRAME_MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    Ok((header[4], len))
}

/// A frame received from a peer, tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// Remote address of the connection the frame arrived on.
    pub from: String,
    /// Identifier of that connection. Differs between reconnects from the
    /// same address.
    pub conn_id: u64,
    /// The frame kind.
    pub kind: FrameKind,
    /// The frame body.
    pub payload: Bytes,
}
