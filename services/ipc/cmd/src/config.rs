//! Configuration handling for the ipc node.
//!
//! Settings come from an optional YAML file, then `QK_IPC_*` environment
//! variables, then command line flags, each layer overriding the previous.

use anyhow::{Context, Result};
use ipc_connection::{Options, Protocol, Side};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Endpoint used when nothing else is configured
pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5555";

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Primary endpoint
    pub endpoint: String,
    /// Messaging pattern
    pub protocol: Protocol,
    /// Dial, listen or auto-negotiate the primary endpoint
    pub side: Side,
    /// Mesh peers dialed after start (bus only)
    pub peers: Vec<String>,
    /// Connection options
    pub options: Options,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            protocol: Protocol::Pair,
            side: Side::Any,
            peers: Vec::new(),
            options: Options::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    ipc: Option<NodeConfig>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.ipc.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final ipc configuration: endpoint={}, protocol={}, side={}, peers={}",
            config.endpoint,
            config.protocol,
            config.side,
            config.peers.len()
        );
        Ok(config)
    }

    /// Apply `QK_IPC_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("QK_IPC_ENDPOINT") {
            info!("Endpoint overridden by environment: {}", endpoint);
            self.endpoint = endpoint;
        }

        if let Some(protocol) = lookup("QK_IPC_PROTOCOL") {
            self.protocol = protocol
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid QK_IPC_PROTOCOL")?;
            info!("Protocol overridden by environment: {}", self.protocol);
        }

        if let Some(side) = lookup("QK_IPC_SIDE") {
            self.side = side
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid QK_IPC_SIDE")?;
            info!("Side overridden by environment: {}", self.side);
        }

        if let Some(peers) = lookup("QK_IPC_PEERS") {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            info!("Peers overridden by environment: {:?}", self.peers);
        }

        if let Some(ms) = lookup("QK_IPC_RECONNECT_MS") {
            let ms: u64 = ms.parse().context("invalid QK_IPC_RECONNECT_MS")?;
            self.options.reconnect = Duration::from_millis(ms);
        }

        if let Some(ms) = lookup("QK_IPC_TIMEOUT_MS") {
            let ms: u64 = ms.parse().context("invalid QK_IPC_TIMEOUT_MS")?;
            self.options.timeout = Duration::from_millis(ms);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.protocol, Protocol::Pair);
        assert_eq!(config.side, Side::Any);
        assert!(config.peers.is_empty());
        assert_eq!(config.options.reconnect, Duration::from_millis(100));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
ipc:
  endpoint: tcp://0.0.0.0:7000
  protocol: bus
  side: server
  peers:
    - tcp://10.0.0.2:7000
    - tcp://10.0.0.3:7000
  options:
    timeout_ms: 5000
    reconnect_ms: 250
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.endpoint, "tcp://0.0.0.0:7000");
        assert_eq!(config.protocol, Protocol::Bus);
        assert_eq!(config.side, Side::Server);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.options.timeout, Duration::from_secs(5));
        assert_eq!(config.options.reconnect, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.endpoint, NodeConfig::default().endpoint);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"ipc:\n  protocol: carrier-pigeon\n").unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("QK_IPC_ENDPOINT", "inproc://node"),
            ("QK_IPC_PROTOCOL", "BUS"),
            ("QK_IPC_PEERS", "inproc://a, inproc://b,"),
            ("QK_IPC_RECONNECT_MS", "10"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.endpoint, "inproc://node");
        assert_eq!(config.protocol, Protocol::Bus);
        assert_eq!(config.side, Side::Any);
        assert_eq!(config.peers, vec!["inproc://a", "inproc://b"]);
        assert_eq!(config.options.reconnect, Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = NodeConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "QK_IPC_SIDE").then(|| "sideways".to_string())
        });
        assert!(result.is_err());
    }
}
