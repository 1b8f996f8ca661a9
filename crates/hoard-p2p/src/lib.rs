//! # Hoard P2P
//!
//! TCP transport for Hoard nodes.
//!
//! Every connection carries length-prefixed [`Frame`]s. Control messages
//! travel as [`FrameKind::Message`] frames and raw file bytes as
//! [`FrameKind::Stream`] frames, so a connection's decode loop always knows
//! how many bytes belong to the current frame and never mistakes file
//! content for a control message.
//!
//! ```text
//!  accept / dial ──► handshake ──► on_peer ──► decode loop ──► Rpc channel
//!                        │             │             │
//!                        └── error ────┴── error ────┴──► closed
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod encoding;
mod error;
mod frame;
mod handshake;
mod peer;
mod transport;

pub use encoding::{Decoder, FramedDecoder, RawDecoder, RAW_BUFFER_SIZE};
pub use error::{DecodeError, P2pError, Result};
pub use frame::{Frame, FrameKind, Rpc, FRAME_HEADER_LEN, FRAME_MAGIC, MAX_FRAME_SIZE, STREAM_CHUNK_SIZE};
pub use handshake::{Handshake, NoHandshake, VersionHandshake};
pub use peer::{ConnectionState, Peer, TcpPeer};
pub use transport::{OnDisconnect, OnPeer, TcpTransport, TcpTransportConfig, Transport};

use std::time::Duration;

/// Default capacity of the inbound [`Rpc`] channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default bound on reading a frame body or writing a frame.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
