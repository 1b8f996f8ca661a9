//! P2P error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during P2P operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// An outbound connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The handshake rejected the connection.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame exceeds [`crate::MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// An operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The inbound channel was already handed out.
    #[error("inbound channel already consumed")]
    AlreadyConsumed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A specialized Result type for P2P operations.
pub type Result<T> = std::result::Result<T, P2pError>;

/// Errors produced while decoding a frame off a connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Reading from the connection failed or hit end of stream.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    /// The frame header did not start with [`crate::FRAME_MAGIC`].
    #[error("invalid frame magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// The frame kind is not known; its body was skipped.
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    /// The frame body exceeds the limit; its body was skipped.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Declared length.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// The frame body did not arrive in time.
    #[error("frame body timed out after {0:?}")]
    Timeout(Duration),
}

impl DecodeError {
    /// Returns true if the connection cannot be read any further.
    ///
    /// I/O failures and partial frames leave the stream position unknown, so
    /// they end the connection. The remaining errors are reported and the
    /// decode loop carries on.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }

    /// Returns true if the remote side closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
