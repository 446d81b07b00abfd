//! Node configuration.
//!
//! Loaded once at startup from a TOML file; every field has a default, so an
//! empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshfs_net::{ConnectionConfig, MAX_FRAME_LEN};
use meshfs_sync::ReplicationConfig;

use crate::error::{NodeError, Result};

/// Smallest frame ceiling that still fits a useful chunk.
const MIN_FRAME_LEN: usize = 1024;

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address peers connect to.
    pub listen_addr: SocketAddr,
    /// Address of the local UI/CLI listener; `None` disables it.
    pub control_addr: Option<SocketAddr>,
    /// Metadata, identity, staging area and replicated files.
    pub data_dir: PathBuf,
    /// Maximum concurrent peer connections.
    pub max_peers: usize,
    /// Name announced to peers.
    pub display_name: String,
    /// Frame ceiling in bytes (at most 65535).
    pub max_frame_len: usize,
    /// Largest file slice per FileChunk.
    pub chunk_size: usize,
    /// Inbound queue capacity per connection.
    pub inbound_capacity: usize,
    /// Outbound queue capacity per priority level.
    pub outbound_capacity: usize,
    /// Fetch content for paths first seen from a peer.
    pub auto_subscribe: bool,
    /// Keepalive period; 0 disables pings.
    pub ping_interval_secs: u64,
    /// Modulus size for a newly generated identity.
    pub rsa_bits: usize,
    /// File this configuration was loaded from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7420)),
            control_addr: Some(SocketAddr::from(([127, 0, 0, 1], 7421))),
            data_dir: PathBuf::from("meshfs-data"),
            max_peers: 16,
            display_name: "meshfs".into(),
            max_frame_len: MAX_FRAME_LEN,
            chunk_size: 32 * 1024,
            inbound_capacity: 64,
            outbound_capacity: 64,
            auto_subscribe: true,
            ping_interval_secs: 30,
            rsa_bits: 2048,
            source: None,
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Write this configuration back to the file it came from, if any.
    pub fn save(&self) -> Result<bool> {
        match &self.source {
            Some(path) => {
                std::fs::write(path, toml::to_string_pretty(self)?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(NodeError::Config("max_peers must be at least 1".into()));
        }
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&self.max_frame_len) {
            return Err(NodeError::Config(format!(
                "max_frame_len must be between {} and {}",
                MIN_FRAME_LEN, MAX_FRAME_LEN
            )));
        }
        if self.chunk_size == 0 {
            return Err(NodeError::Config("chunk_size must be positive".into()));
        }
        if self.inbound_capacity == 0 || self.outbound_capacity == 0 {
            return Err(NodeError::Config("queue capacities must be positive".into()));
        }
        if self.display_name.trim().is_empty() {
            return Err(NodeError::Config("display_name must not be empty".into()));
        }
        Ok(())
    }

    /// SQLite metadata database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("meta.db")
    }

    /// PEM-encoded private key.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.pem")
    }

    /// Partially received downloads.
    pub fn stage_dir(&self) -> PathBuf {
        self.data_dir.join("stage")
    }

    /// Root of the replicated tree.
    pub fn root_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Keepalive period, if enabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        match self.ping_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Per-connection settings.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_frame_len: self.max_frame_len,
            inbound_capacity: self.inbound_capacity,
            outbound_capacity: self.outbound_capacity,
            ..ConnectionConfig::default()
        }
    }

    /// Replication settings.
    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            chunk_size: self.chunk_size,
            max_frame_len: self.max_frame_len,
            auto_subscribe: self.auto_subscribe,
            ..ReplicationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(NodeConfig::from_toml_str("").unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = NodeConfig::from_toml_str(
            r#"
            listen_addr = "127.0.0.1:9000"
            data_dir = "/var/lib/meshfs"
            max_peers = 2
            display_name = "laptop"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.max_peers, 2);
        assert_eq!(config.display_name, "laptop");
        assert_eq!(config.chunk_size, NodeConfig::default().chunk_size);
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/meshfs/meta.db"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str("max_peers = 0"),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("max_frame_len = 70000"),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("listen_addr = 5"),
            Err(NodeError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshfs.toml");
        std::fs::write(&path, "display_name = \"a\"\n").unwrap();

        let mut config = NodeConfig::load(&path).unwrap();
        config.data_dir = PathBuf::from("/elsewhere");
        assert!(config.save().unwrap());

        let reloaded = NodeConfig::load(&path).unwrap();
        assert_eq!(reloaded.data_dir, PathBuf::from("/elsewhere"));
        assert_eq!(reloaded.display_name, "a");
    }

    #[test]
    fn test_ping_interval() {
        let mut config = NodeConfig::default();
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(30)));
        config.ping_interval_secs = 0;
        assert_eq!(config.ping_interval(), None);
    }
}
