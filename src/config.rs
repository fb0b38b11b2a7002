//! Configuration for a swarm node.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use multiaddr::Multiaddr;
use serde::Deserialize;

use crate::bitswap::ProtocolId;

const ENV_CONFIG_DIR: &str = "IROH_SWARM_CONFIG_DIR";

/// Name of the optional config file in the config directory.
pub const CONFIG_FILE_NAME: &str = "swarm.config.toml";

/// Name of the directory wrapping our files in the platform config directory.
const CONFIG_DIR: &str = "iroh-swarm";

/// Configuration of a node.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub swarm: SwarmConfig,
    pub bitswap: BitswapConfig,
    /// Where the identity is stored, defaults to `keypair` in the config directory.
    pub key_file: Option<PathBuf>,
    /// `tracing` filter directive, takes precedence over `RUST_LOG`.
    pub rust_log: Option<String>,
}

impl Config {
    /// Loads the configuration.
    ///
    /// If `file` is `Some` the configuration is read from it. Otherwise the default config file
    /// is loaded if present, and the default config is used if not.
    pub async fn load(file: Option<&Path>) -> Result<Config> {
        let default_config = config_path(CONFIG_FILE_NAME)?;
        let config_file = match file {
            Some(file) => Some(file),
            None if default_config.exists() => Some(default_config.as_ref()),
            None => None,
        };
        match config_file {
            Some(file) => {
                let source = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("failed to read config {}", file.display()))?;
                Self::load_toml(&source)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn load_toml(s: &str) -> Result<Config> {
        let config = toml::from_str(s)?;
        Ok(config)
    }

    /// The key file to use, falling back to the config directory.
    pub fn key_file(&self) -> Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(path.clone()),
            None => config_path("keypair"),
        }
    }
}

/// Connection management.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmConfig {
    /// Addresses to listen on when the swarm starts.
    pub listen_addrs: Vec<Multiaddr>,
    /// Peers registered when the swarm starts, each must end in `/p2p/<id>`.
    pub bootstrap: Vec<Multiaddr>,
    /// Whether to keep the connection count up by dialing known peers.
    pub auto_dial: bool,
    pub min_connections: usize,
    pub max_connections: Option<usize>,
    /// If not empty, only addresses matching one of these are dialed.
    pub allow: Vec<Multiaddr>,
    /// Addresses matching any of these are never dialed.
    pub deny: Vec<Multiaddr>,
    /// Bound on the secure channel handshake, in seconds.
    pub handshake_timeout: u64,
    /// Bound on dialing and upgrading a connection, in seconds.
    pub dial_timeout: u64,
    pub agent_version: String,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            listen_addrs: Vec::new(),
            bootstrap: Vec::new(),
            auto_dial: true,
            min_connections: 16,
            max_connections: None,
            allow: Vec::new(),
            deny: Vec::new(),
            handshake_timeout: 30,
            dial_timeout: 60,
            agent_version: format!("iroh-swarm/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SwarmConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }
}

/// Block exchange.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct BitswapConfig {
    /// Protocol versions to answer, the first one is also preferred when sending.
    pub protocols: Vec<ProtocolId>,
    /// Largest message accepted from a peer.
    pub max_message_size: usize,
}

impl Default for BitswapConfig {
    fn default() -> Self {
        BitswapConfig {
            protocols: vec![ProtocolId::Bitswap110, ProtocolId::Bitswap100],
            max_message_size: crate::protocol::MAX_MESSAGE_SIZE,
        }
    }
}

/// Returns the path to the config directory.
///
/// If the `IROH_SWARM_CONFIG_DIR` environment variable is set it is used unconditionally,
/// otherwise `iroh-swarm` inside the platform config directory.
pub fn config_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for configuration"))?;
    Ok(cfg.join(CONFIG_DIR))
}

/// Path that leads to a file in the config directory.
pub fn config_path(file_name: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(config_root()?.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_invalid_field() {
        let source = r#"
          not_a_field = true
        "#;
        assert!(Config::load_toml(source).is_err());

        let source = r#"
          [swarm]
          not_a_field = true
        "#;
        assert!(Config::load_toml(source).is_err());
    }

    #[test]
    fn test_toml_empty_is_default() {
        let config = Config::load_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.swarm.min_connections, 16);
        assert_eq!(config.swarm.handshake_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_toml_swarm() {
        let source = r#"
            rust_log = "iroh_swarm=debug"

            [swarm]
            listen_addrs = ["/ip4/0.0.0.0/tcp/4001"]
            min_connections = 2
            max_connections = 8
            deny = ["/ip4/10.0.0.1"]
            handshake_timeout = 5

            [bitswap]
            protocols = ["/ipfs/bitswap/1.0.0"]
        "#;
        let config = Config::load_toml(source).unwrap();
        assert_eq!(config.rust_log.as_deref(), Some("iroh_swarm=debug"));
        assert_eq!(
            config.swarm.listen_addrs,
            vec!["/ip4/0.0.0.0/tcp/4001".parse::<Multiaddr>().unwrap()]
        );
        assert_eq!(config.swarm.min_connections, 2);
        assert_eq!(config.swarm.max_connections, Some(8));
        assert_eq!(config.swarm.deny.len(), 1);
        assert!(config.swarm.auto_dial);
        assert_eq!(config.swarm.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.bitswap.protocols, vec![ProtocolId::Bitswap100]);
    }

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        tokio::fs::write(&path, "[swarm]\nauto_dial = false\n")
            .await
            .unwrap();
        let config = Config::load(Some(&path)).await.unwrap();
        assert!(!config.swarm.auto_dial);

        let missing = dir.path().join("missing.toml");
        assert!(Config::load(Some(&missing)).await.is_err());
    }
}
