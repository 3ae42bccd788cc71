//! # Daemon Configuration
//!
//! Settings come from three places, later ones winning:
//!
//! 1. built-in defaults,
//! 2. a TOML file (`--config`, or `config.toml` in the data directory),
//! 3. command-line flags and their `TESSERA_*` environment fallbacks.
//!
//! ```toml
//! data_dir = "/var/lib/tessera"
//! log_format = "json"
//! api_addr = "127.0.0.1:9750"
//! sync_interval_secs = 60
//!
//! [[storage_node]]
//! id = "gateway-eu"
//! url = "https://storage-eu.example.org"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tessera_protocol::config::{NODE_REQUEST_TIMEOUT, PERIODIC_SYNC_INTERVAL};
use tessera_protocol::WalletConfig;

use crate::logging::LogFormat;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "wallet.key";
const DB_DIR_NAME: &str = "db";

/// One remote storage gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEndpoint {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    /// Where `serve` binds the status API.
    pub api_addr: SocketAddr,
    pub sync_interval_secs: u64,
    /// Per-request timeout against storage gateways.
    pub request_timeout_ms: u64,
    /// Adds an in-process storage node. For local experiments only: its
    /// contents are gone when the daemon exits.
    pub devnet: bool,
    #[serde(rename = "storage_node")]
    pub storage_nodes: Vec<NodeEndpoint>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tessera"),
            log_format: LogFormat::Pretty,
            api_addr: SocketAddr::from(([127, 0, 0, 1], 9750)),
            sync_interval_secs: PERIODIC_SYNC_INTERVAL.as_secs(),
            request_timeout_ms: NODE_REQUEST_TIMEOUT.as_millis() as u64,
            devnet: false,
            storage_nodes: Vec::new(),
        }
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub api_addr: Option<SocketAddr>,
    pub devnet: bool,
}

impl DaemonConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid daemon configuration")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to encode daemon configuration")
    }

    /// Resolves the effective configuration. An explicit `--config` file
    /// must exist; the data directory's `config.toml` is optional.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let mut config = match &overrides.config {
            Some(path) => Self::read(path)?,
            None => {
                let data_dir = overrides
                    .data_dir
                    .clone()
                    .unwrap_or_else(|| Self::default().data_dir);
                let path = data_dir.join(CONFIG_FILE_NAME);
                if path.exists() {
                    Self::read(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply(overrides);
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        if let Some(addr) = overrides.api_addr {
            self.api_addr = addr;
        }
        self.devnet |= overrides.devnet;
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE_NAME)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_DIR_NAME)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Engine settings with this file's overrides applied.
    pub fn wallet_config(&self) -> WalletConfig {
        let mut config = WalletConfig::default();
        config.sync.interval = Duration::from_secs(self.sync_interval_secs.max(1));
        config.resolver.request_timeout = self.request_timeout();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(DaemonConfig::from_toml("").unwrap(), DaemonConfig::default());
    }

    #[test]
    fn parses_storage_nodes_and_settings() {
        let config = DaemonConfig::from_toml(
            r#"
            data_dir = "/tmp/w"
            log_format = "json"
            sync_interval_secs = 5

            [[storage_node]]
            id = "a"
            url = "http://127.0.0.1:8080"

            [[storage_node]]
            id = "b"
            url = "http://127.0.0.1:8081"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/w"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.storage_nodes.len(), 2);
        assert_eq!(config.storage_nodes[1].id, "b");
        assert_eq!(config.wallet_config().sync.interval, Duration::from_secs(5));
        assert_eq!(config.key_path(), PathBuf::from("/tmp/w/wallet.key"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DaemonConfig::from_toml("sync_every = 3").is_err());
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "log_format = \"json\"\ndevnet = false\n").unwrap();

        let config = DaemonConfig::resolve(&Overrides {
            config: Some(file),
            data_dir: Some(dir.path().to_path_buf()),
            log_format: Some(LogFormat::Pretty),
            api_addr: None,
            devnet: true,
        })
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.data_dir, dir.path());
        assert!(config.devnet);
    }

    #[test]
    fn data_dir_config_is_optional_but_explicit_file_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Overrides::default()
        };
        assert_eq!(DaemonConfig::resolve(&overrides).unwrap().data_dir, dir.path());

        let missing = Overrides {
            config: Some(dir.path().join("nope.toml")),
            ..Overrides::default()
        };
        assert!(DaemonConfig::resolve(&missing).is_err());
    }

    #[test]
    fn written_config_reads_back() {
        let mut config = DaemonConfig::default();
        config.storage_nodes.push(NodeEndpoint {
            id: "a".into(),
            url: "http://localhost:1".into(),
        });
        let text = config.to_toml().unwrap();
        assert_eq!(DaemonConfig::from_toml(&text).unwrap(), config);
    }
}
