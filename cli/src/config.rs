//! `tilefeed.yaml` loading and environment overrides.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tilefeed_core::{EventKindTable, IndexerConfig};
use tilefeed_rpc::HttpClientConfig;
use tilefeed_stream::{StatsConfig, StreamConfig};

use crate::logging::LogConfig;

pub const ENV_RPC_URL: &str = "TILEFEED_RPC_URL";
pub const ENV_DATABASE_URL: &str = "TILEFEED_DATABASE_URL";
pub const ENV_LISTEN_ADDR: &str = "TILEFEED_LISTEN_ADDR";

/// Top-level configuration of the `tilefeed` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Address the live WebSocket server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Extra or replacement `selector → kind name` entries.
    #[serde(default)]
    pub event_kinds: HashMap<String, String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7171".into()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            indexer: IndexerConfig::default(),
            stream: StreamConfig::default(),
            stats: StatsConfig::default(),
            store: StoreConfig::default(),
            log: LogConfig::default(),
            listen_addr: default_listen_addr(),
            event_kinds: HashMap::new(),
        }
    }
}

/// Ledger endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_url")]
    pub url: String,
    /// Only events emitted by this contract are read. `None` reads all.
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default, flatten)]
    pub http: HttpClientConfig,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:5050/rpc".into()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            contract_address: None,
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// SQLite file path or `sqlite:` URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_database_url() -> String {
    "./tilefeed.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: default_database_url(),
        }
    }
}

impl FeedConfig {
    /// Load `path` if given (a missing file is an error), then apply the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config '{}'", path.display()))?;
                Self::from_yaml(&text)
                    .with_context(|| format!("invalid config '{}'", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Override fields from `lookup` (the environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.rpc.url = url;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.store.database_url = url;
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            self.listen_addr = addr;
        }
    }

    /// The selector table with `event_kinds` applied.
    pub fn event_table(&self) -> Result<EventKindTable> {
        EventKindTable::with_overrides(&self.event_kinds).context("invalid event_kinds entry")
    }
}
