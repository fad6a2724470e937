use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snare_log::{Format, Level};
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1";
pub const DEFAULT_DNS_SERVER: &str = "8.8.8.8";
/// RSA modulus length for the CA and every minted leaf. The signers behind
/// rustls reject anything below 2048 bits.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Runtime configuration for the proxy supervisor, loaded from a JSON file.
/// Port `0` requests an ephemeral port; the supervisor writes the bound port
/// back into the vector once the listener is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ca_key_file: String,
    pub ca_cert_file: String,
    pub ca_key_bits: usize,
    pub listen_addr: String,
    pub https_ports: Vec<u16>,
    pub http_ports: Vec<u16>,
    pub dns_port: u16,
    pub dns_server: String,
    pub dns_regex: String,
    pub log_responses: bool,
    pub log_level: Level,
    pub log_format: Format,
    pub request_log_file: String,
    pub webhook_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ca_key_file: String::new(),
            ca_cert_file: String::new(),
            ca_key_bits: DEFAULT_KEY_BITS,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            https_ports: Vec::new(),
            http_ports: Vec::new(),
            dns_port: 0,
            dns_server: String::new(),
            dns_regex: String::new(),
            log_responses: false,
            log_level: Level::Info,
            log_format: Format::Text,
            request_log_file: String::new(),
            webhook_url: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path.as_ref()).map_err(|error| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            error,
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), data).map_err(|error| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            error,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        if self.ca_key_bits < DEFAULT_KEY_BITS {
            return Err(ConfigError::KeyBitsTooSmall {
                bits: self.ca_key_bits,
            });
        }
        if self.ca_cert_file.is_empty() != self.ca_key_file.is_empty() {
            return Err(ConfigError::PartialCaPathPair);
        }
        if !self.dns_server.is_empty() && self.dns_server.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidDnsServer {
                value: self.dns_server.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to decode config: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("ca_key_bits must be at least 2048, got {bits}")]
    KeyBitsTooSmall { bits: usize },
    #[error("ca_cert_file and ca_key_file must be provided together")]
    PartialCaPathPair,
    #[error("dns_server must be an IP address, got {value:?}")]
    InvalidDnsServer { value: String },
}
