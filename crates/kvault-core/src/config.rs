use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};

/// PBKDF2 iteration count below which a warning is logged
pub const MIN_RECOMMENDED_PBKDF2_ITERATIONS: u32 = 100_000;

/// Top-level configuration (loaded from kvault.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvaultConfig {
    /// Warn if the config file is world-readable (default: true)
    pub config_file_mode_check: bool,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding encrypted secret records
    pub secrets_file: PathBuf,
    /// Directory holding encrypted file blobs
    pub blob_dir: PathBuf,
}

/// Key-derivation algorithm used for new writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    Pbkdf2Sha256,
    Argon2id,
}

/// Encryption parameters applied to new writes.
///
/// Existing records carry their own parameters and are always read with those.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// KDF for new secrets and files (default: pbkdf2-sha256)
    pub kdf: KdfAlgorithm,
    /// PBKDF2-HMAC-SHA256 iterations (default: 100000)
    pub pbkdf2_iterations: u32,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for KvaultConfig {
    fn default() -> Self {
        Self {
            config_file_mode_check: true,
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            crypto: CryptoConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            secrets_file: PathBuf::from("~/.local/share/kvault/secrets.json"),
            blob_dir: PathBuf::from("~/.local/share/kvault/blobs"),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf: KdfAlgorithm::Pbkdf2Sha256,
            pbkdf2_iterations: 100_000,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl KvaultConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> VaultResult<Self> {
        toml::from_str(content).map_err(|e| VaultError::Config(format!("parsing config: {e}")))
    }

    /// Reject settings that cannot work. Weak-but-valid KDF settings only warn.
    pub fn validate(&self) -> VaultResult<()> {
        if !matches!(self.logging.format.as_str(), "json" | "text") {
            return Err(VaultError::Config(format!(
                "logging.format must be \"json\" or \"text\", got {:?}",
                self.logging.format
            )));
        }
        if self.storage.secrets_file.as_os_str().is_empty() {
            return Err(VaultError::Config("storage.secrets_file is empty".into()));
        }
        if self.storage.blob_dir.as_os_str().is_empty() {
            return Err(VaultError::Config("storage.blob_dir is empty".into()));
        }
        if self.storage.secrets_file.is_dir() {
            return Err(VaultError::Config(format!(
                "storage.secrets_file is a directory: {}",
                self.storage.secrets_file.display()
            )));
        }

        match self.crypto.kdf {
            KdfAlgorithm::Pbkdf2Sha256 => {
                if self.crypto.pbkdf2_iterations == 0 {
                    return Err(VaultError::Config(
                        "crypto.pbkdf2_iterations must be greater than zero".into(),
                    ));
                }
                if self.crypto.pbkdf2_iterations < MIN_RECOMMENDED_PBKDF2_ITERATIONS {
                    tracing::warn!(
                        iterations = self.crypto.pbkdf2_iterations,
                        recommended = MIN_RECOMMENDED_PBKDF2_ITERATIONS,
                        "PBKDF2 iteration count is below the recommended minimum"
                    );
                }
            }
            KdfAlgorithm::Argon2id => {
                if self.crypto.argon2_time_cost == 0 || self.crypto.argon2_parallelism == 0 {
                    return Err(VaultError::Config(
                        "crypto.argon2_time_cost and crypto.argon2_parallelism must be non-zero"
                            .into(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Expand paths, then validate, so path checks see the real locations.
    pub fn resolve(self) -> VaultResult<Self> {
        let config = self.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Expand `~` in every configured path
    pub fn expand_paths(mut self) -> Self {
        self.storage.secrets_file = expand_tilde(&self.storage.secrets_file);
        self.storage.blob_dir = expand_tilde(&self.storage.blob_dir);
        self
    }
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}
