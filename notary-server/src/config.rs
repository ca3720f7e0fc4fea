//! Configuration for the notary server

use notary_core::{Error, MessageType, NymId, Result, StorageConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Notary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Numbers granted per getTransactionNumbers request
    pub numbers_per_request: usize,

    /// Maximum numbers a nym may hold issued at once
    pub max_issued_numbers: usize,

    /// Refuse every nym except the admin nym
    pub locked: bool,

    /// Admin nym (hex), exempt from the server lock
    pub admin_nym: Option<String>,

    /// Timeout for acquiring a client context (milliseconds)
    pub lock_timeout_ms: u64,

    /// Actor mailbox size
    pub mailbox_size: usize,

    /// Commands dropping a reply notice in addition to the built-in set
    #[serde(default)]
    pub extra_notice_commands: Vec<String>,

    /// Hex seed of the notary signing key; generated when absent
    pub signing_seed: Option<String>,
}

impl Default for NotaryConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                data_dir: PathBuf::from("./data/notary-server"),
                ..StorageConfig::default()
            },
            numbers_per_request: 50,
            max_issued_numbers: 500,
            locked: false,
            admin_nym: None,
            lock_timeout_ms: 5_000,
            mailbox_size: 1000,
            extra_notice_commands: Vec::new(),
            signing_seed: None,
        }
    }
}

impl NotaryConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NotaryConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = NotaryConfig::default();

        if let Ok(data_dir) = std::env::var("NOTARY_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(count) = std::env::var("NOTARY_NUMBERS_PER_REQUEST") {
            config.numbers_per_request = count
                .parse()
                .map_err(|e| Error::Config(format!("NOTARY_NUMBERS_PER_REQUEST: {}", e)))?;
        }

        if let Ok(locked) = std::env::var("NOTARY_LOCKED") {
            config.locked = locked == "1" || locked.eq_ignore_ascii_case("true");
        }

        if let Ok(admin) = std::env::var("NOTARY_ADMIN_NYM") {
            config.admin_nym = Some(admin);
        }

        if let Ok(seed) = std::env::var("NOTARY_SIGNING_SEED") {
            config.signing_seed = Some(seed);
        }

        Ok(config)
    }

    /// Parsed admin nym
    pub fn admin_nym_id(&self) -> Result<Option<NymId>> {
        self.admin_nym
            .as_deref()
            .map(|hex| notary_core::Identifier::from_hex(hex).map(NymId::new))
            .transpose()
    }

    /// Parsed extra reply-notice commands
    pub fn extra_notice_commands(&self) -> Result<Vec<MessageType>> {
        self.extra_notice_commands
            .iter()
            .map(|name| match MessageType::from_name(name) {
                Some((command, false)) => Ok(command),
                _ => Err(Error::Config(format!("Unknown command {}", name))),
            })
            .collect()
    }

    /// Parsed signing seed
    pub fn signing_seed(&self) -> Result<Option<[u8; 32]>> {
        let Some(seed) = self.signing_seed.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(seed).map_err(|e| Error::Config(format!("signing_seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("signing_seed must be 32 bytes".to_string()))?;
        Ok(Some(seed))
    }
}
