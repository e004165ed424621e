//! Node configuration, read from a TOML file

use log::info;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};

use crate::blockchain::crypto::{CryptoError, User};
use crate::blockchain::ProtocolParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid miner key: {0}")]
    Key(#[from] CryptoError),

    #[error("{0} must not be empty")]
    Missing(&'static str),

    #[error("protocol.{0} must be positive")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory of the sled block store
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,

    /// File holding the miner's purse; created on first start
    pub key_file: PathBuf,

    pub protocol: ProtocolParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("data/blockchain"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            key_file: PathBuf::from("data/miner.key"),
            protocol: ProtocolParams::default(),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl NodeConfig {
    /// Reads the file at `path`, or falls back to defaults when no path is
    /// given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(io_error(path))?;
                info!("Loaded configuration from {}", path.display());
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };
        config.check()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("data_dir"));
        }
        if self.key_file.as_os_str().is_empty() {
            return Err(ConfigError::Missing("key_file"));
        }
        if self.host.is_empty() {
            return Err(ConfigError::Missing("host"));
        }
        if self.protocol.txs_limit == 0 {
            return Err(ConfigError::NotPositive("txs_limit"));
        }
        // empty nonces would all collide
        if self.protocol.rand_bytes == 0 {
            return Err(ConfigError::NotPositive("rand_bytes"));
        }
        Ok(())
    }

    /// Restores the miner from the key file, generating and saving a new key
    /// when the file does not exist yet
    pub fn load_or_create_miner<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<User, ConfigError> {
        let path = self.key_file.as_path();
        if path.exists() {
            let purse = fs::read_to_string(path).map_err(io_error(path))?;
            let miner = User::load(&purse)?;
            info!("Loaded miner {} from {}", miner.address(), path.display());
            return Ok(miner);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let miner = User::new(rng);
        fs::write(path, miner.purse()).map_err(io_error(path))?;
        info!("Created miner {} in {}", miner.address(), path.display());
        Ok(miner)
    }
}
