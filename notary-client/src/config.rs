//! Configuration for the notary client

use notary_core::{Error, Result, StorageConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local storage for boxes, accounts and contexts
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ask for more numbers once fewer than this many are available
    pub low_water_mark: usize,

    /// Numbers asked for per getTransactionNumbers (the notary may grant fewer)
    pub numbers_per_request: usize,

    /// Timeout for acquiring a server context (milliseconds)
    pub lock_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                data_dir: PathBuf::from("./data/notary-client"),
                ..StorageConfig::default()
            },
            low_water_mark: 10,
            numbers_per_request: 50,
            lock_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = ClientConfig::default();

        if let Ok(data_dir) = std::env::var("NOTARY_CLIENT_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(mark) = std::env::var("NOTARY_CLIENT_LOW_WATER_MARK") {
            config.low_water_mark = mark
                .parse()
                .map_err(|e| Error::Config(format!("NOTARY_CLIENT_LOW_WATER_MARK: {}", e)))?;
        }

        if let Ok(count) = std::env::var("NOTARY_CLIENT_NUMBERS_PER_REQUEST") {
            config.numbers_per_request = count
                .parse()
                .map_err(|e| Error::Config(format!("NOTARY_CLIENT_NUMBERS_PER_REQUEST: {}", e)))?;
        }

        Ok(config)
    }
}
