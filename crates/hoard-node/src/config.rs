//! Node configuration.

use crate::server::FileServerOpts;
use crate::{NodeError, Result};
use hoard_p2p::{FramedDecoder, NoHandshake, RawDecoder, TcpTransportConfig, VersionHandshake};
use hoard_storage::{cas_path_transform, default_path_transform, PathTransform};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How keys map to on-disk paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathTransformKind {
    /// SHA-1 content addressing.
    Cas,
    /// `default/<key>`.
    Plain,
}

/// Handshake run on new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeKind {
    /// Accept everyone.
    None,
    /// Exchange and check protocol versions.
    Version,
}

/// Frame decoder used on connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Length-prefixed frames.
    Framed,
    /// One read per message, unframed. Cannot tell file bytes from
    /// messages, so a file server refuses it.
    Raw,
}

/// Configuration for a Hoard node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address to listen on; also advertised to peers.
    pub listen_addr: String,
    /// Root folder of the local store.
    pub storage_root: PathBuf,
    /// Addresses dialed on start.
    pub bootstrap_nodes: Vec<String>,
    /// Key layout.
    pub path_transform: PathTransformKind,
    /// Connection handshake.
    pub handshake: HandshakeKind,
    /// Connection decoder.
    pub decoder: DecoderKind,
    /// Capacity of the inbound frame channel.
    pub channel_capacity: usize,
    /// Bound on a frame body arriving once its header has.
    pub read_timeout_secs: u64,
    /// Bound on each write to a peer.
    pub write_timeout_secs: u64,
    /// Bound on waiting for peers to deliver a fetched file.
    pub fetch_timeout_secs: u64,
    /// Log level.
    pub log_level: String,
    /// Log format (`pretty` or `json`).
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            storage_root: PathBuf::from(hoard_storage::DEFAULT_ROOT),
            bootstrap_nodes: Vec::new(),
            path_transform: PathTransformKind::Cas,
            handshake: HandshakeKind::None,
            decoder: DecoderKind::Framed,
            channel_capacity: hoard_p2p::DEFAULT_CHANNEL_CAPACITY,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            fetch_timeout_secs: 10,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Loads a YAML configuration file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(NodeError::Config("listen_addr must not be empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(NodeError::Config("channel_capacity must be positive".into()));
        }
        for (name, secs) in [
            ("read_timeout_secs", self.read_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
        ] {
            if secs == 0 {
                return Err(NodeError::Config(format!("{name} must be positive")));
            }
        }
        if self.decoder == DecoderKind::Raw {
            return Err(NodeError::Config(
                "decoder: raw cannot carry replication traffic; use framed".into(),
            ));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(NodeError::Config(format!(
                "unknown log level: {}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Returns the configured key layout.
    #[must_use]
    pub fn path_transform_fn(&self) -> PathTransform {
        match self.path_transform {
            PathTransformKind::Cas => Arc::new(cas_path_transform),
            PathTransformKind::Plain => Arc::new(default_path_transform),
        }
    }

    /// Builds the transport configuration.
    #[must_use]
    pub fn transport_config(&self) -> TcpTransportConfig {
        let read_timeout = Duration::from_secs(self.read_timeout_secs);
        let mut config = TcpTransportConfig::new(self.listen_addr.clone())
            .with_channel_capacity(self.channel_capacity)
            .with_write_timeout(Duration::from_secs(self.write_timeout_secs));

        config = match self.handshake {
            HandshakeKind::None => config.with_handshake(NoHandshake),
            HandshakeKind::Version => {
                config.with_handshake(VersionHandshake::new().with_timeout(read_timeout))
            }
        };
        match self.decoder {
            DecoderKind::Framed => {
                config.with_decoder(FramedDecoder::new().with_body_timeout(read_timeout))
            }
            DecoderKind::Raw => config.with_decoder(RawDecoder),
        }
    }

    /// Builds the file server options.
    #[must_use]
    pub fn server_opts(&self) -> FileServerOpts {
        FileServerOpts {
            storage_root: self.storage_root.clone(),
            path_transform: self.path_transform_fn(),
            bootstrap_nodes: self.bootstrap_nodes.clone(),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}
