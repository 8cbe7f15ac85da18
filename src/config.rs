use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::recovery::{DEFAULT_ADDRESS_WINDOW, DEFAULT_GAP_LIMIT};
use crate::derivation::AssetType;
use crate::secret::KdfParams;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WalletConfig {
    #[serde(default = "default_assets")]
    pub assets: Vec<AssetType>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/wallet".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SecurityConfig {
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,
    #[serde(default = "default_min_password_strength")]
    pub min_password_strength: f32,
    #[serde(default = "default_seed_guard_ttl_secs")]
    pub seed_guard_ttl_secs: u64,
}

fn default_pbkdf2_iterations() -> u32 {
    KdfParams::default().pbkdf2_iterations
}

fn default_argon2_memory_kib() -> u32 {
    KdfParams::default().argon2_memory_kib
}

fn default_argon2_iterations() -> u32 {
    KdfParams::default().argon2_iterations
}

fn default_min_password_strength() -> f32 {
    0.5
}

fn default_seed_guard_ttl_secs() -> u64 {
    60
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: default_pbkdf2_iterations(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            min_password_strength: default_min_password_strength(),
            seed_guard_ttl_secs: default_seed_guard_ttl_secs(),
        }
    }
}

impl SecurityConfig {
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            pbkdf2_iterations: self.pbkdf2_iterations,
            argon2_memory_kib: self.argon2_memory_kib,
            argon2_iterations: self.argon2_iterations,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default = "default_gap_limit")]
    pub account_gap_limit: u32,
    /// Receive and change addresses probed per account
    #[serde(default = "default_address_window")]
    pub address_window: u32,
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

fn default_address_window() -> u32 {
    DEFAULT_ADDRESS_WINDOW
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            account_gap_limit: default_gap_limit(),
            address_window: default_address_window(),
        }
    }
}

fn default_assets() -> Vec<AssetType> {
    AssetType::ALL.to_vec()
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            assets: default_assets(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl WalletConfig {
    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        info!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        warn!("Error parsing config: {}. Using defaults.", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("Error reading config: {}. Using defaults.", e);
                    Self::default()
                }
            }
        } else {
            info!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                if let Err(e) = std::fs::write(path, s) {
                    warn!("Could not write default config: {}", e);
                }
            }
            config
        }
    }
}
