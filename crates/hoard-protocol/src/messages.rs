//! Replication message definitions.

use crate::{ProtocolError, Result, Version, MAGIC, MAX_FIELD_LEN, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Payload discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    /// A file follows as raw stream bytes.
    StoreFile = 1,
    /// Drop a key.
    DeleteFile = 2,
    /// Ask peers for a key.
    GetFile = 3,
}

impl PayloadKind {
    /// Parse a payload kind from a byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Self::StoreFile),
            2 => Ok(Self::DeleteFile),
            3 => Ok(Self::GetFile),
            _ => Err(ProtocolError::UnknownKind(b)),
        }
    }
}

/// The operation carried by a [`ReplicationMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `size` raw bytes for `key` follow this message on the same connection.
    StoreFile {
        /// Logical key.
        key: String,
        /// Exact number of payload bytes that follow.
        size: i64,
    },
    /// Remove `key` from the receiver's store.
    DeleteFile {
        /// Logical key.
        key: String,
    },
    /// Ask the receiver to send `key` back if it has it.
    GetFile {
        /// Logical key.
        key: String,
    },
}

impl Payload {
    /// Returns the discriminant.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::StoreFile { .. } => PayloadKind::StoreFile,
            Self::DeleteFile { .. } => PayloadKind::DeleteFile,
            Self::GetFile { .. } => PayloadKind::GetFile,
        }
    }

    /// Returns the key the payload refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::StoreFile { key, .. } | Self::DeleteFile { key } | Self::GetFile { key } => key,
        }
    }
}

/// Control envelope exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationMessage {
    /// Listen address of the node that produced the message.
    pub from: String,
    /// The operation.
    pub payload: Payload,
}

impl ReplicationMessage {
    /// Creates a new message.
    #[must_use]
    pub fn new(from: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            payload,
        }
    }

    /// Creates a store announcement.
    #[must_use]
    pub fn store_file(from: impl Into<String>, key: impl Into<String>, size: i64) -> Self {
        Self::new(
            from,
            Payload::StoreFile {
                key: key.into(),
                size,
            },
        )
    }

    /// Creates a delete request.
    #[must_use]
    pub fn delete_file(from: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(from, Payload::DeleteFile { key: key.into() })
    }

    /// Creates a fetch request.
    #[must_use]
    pub fn get_file(from: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(from, Payload::GetFile { key: key.into() })
    }

    /// Encodes the message to bytes.
    ///
    /// Format (big-endian):
    /// - 4 bytes: magic
    /// - 6 bytes: protocol version
    /// - 1 byte: payload kind
    /// - 2 bytes + N: sender address
    /// - 2 bytes + N: key
    /// - 8 bytes: size (`StoreFile` only)
    ///
    /// # Errors
    ///
    /// Returns an error if the sender address or key is longer than
    /// [`MAX_FIELD_LEN`].
    pub fn encode(&self) -> Result<Bytes> {
        let key = self.payload.key();
        let mut buf = BytesMut::with_capacity(4 + 6 + 1 + 4 + self.from.len() + key.len() + 8);
        buf.put_slice(&MAGIC);
        PROTOCOL_VERSION.put(&mut buf);
        buf.put_u8(self.payload.kind() as u8);
        put_str(&mut buf, &self.from)?;
        put_str(&mut buf, key)?;
        if let Payload::StoreFile { size, .. } = &self.payload {
            buf.put_i64(*size);
        }
        Ok(buf.freeze())
    }

    /// Decodes a message from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed, carries an unknown
    /// payload kind, or was produced by an incompatible protocol version.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < MAGIC.len() {
            return Err(ProtocolError::Malformed("message too short".into()));
        }
        if buf[..MAGIC.len()] != MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }
        buf.advance(MAGIC.len());

        let version = Version::get(&mut buf)
            .ok_or_else(|| ProtocolError::Malformed("truncated version".into()))?;
        if !version.is_compatible_with(&PROTOCOL_VERSION) {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        if !buf.has_remaining() {
            return Err(ProtocolError::Malformed("missing payload kind".into()));
        }
        let kind = PayloadKind::from_byte(buf.get_u8())?;

        let from = get_str(&mut buf, "sender")?;
        let key = get_str(&mut buf, "key")?;

        let payload = match kind {
            PayloadKind::StoreFile => {
                if buf.remaining() < 8 {
                    return Err(ProtocolError::Malformed("truncated size".into()));
                }
                let size = buf.get_i64();
                if size < 0 {
                    return Err(ProtocolError::Malformed(format!("negative size: {size}")));
                }
                Payload::StoreFile { key, size }
            }
            PayloadKind::DeleteFile => Payload::DeleteFile { key },
            PayloadKind::GetFile => Payload::GetFile { key },
        };

        if buf.has_remaining() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self { from, payload })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong {
        size: s.len(),
        max: MAX_FIELD_LEN,
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8], field: &str) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Malformed(format!("truncated {field} length")));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Malformed(format!("truncated {field}")));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|e| ProtocolError::Malformed(format!("invalid {field}: {e}")))?;
    buf.advance(len);
    Ok(s)
}
