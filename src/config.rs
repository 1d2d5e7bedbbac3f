//! Engine configuration.
//!
//! Configuration reaches the core as a list of `(key, value)` string
//! pairs produced by the configuration collaborator. Only the keys below
//! are known; anything else is rejected at load time, and a load failure
//! is fatal to the application.

use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Upload slot budget: a fixed count, or derived from the upload rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSlots {
    Fixed(usize),
    Auto,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// All tunables the engine consumes.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the peer listener binds.
    pub listen_port: u16,
    /// Optional single address to restrict the listener to.
    pub listen_ip: Option<IpAddr>,
    /// Upload slot budget for the choker.
    pub max_upload_slots: UploadSlots,
    /// Upload cap in KB/s; 0 means unlimited.
    pub max_upload_rate: u64,
    /// Download cap in KB/s; 0 means unlimited.
    pub max_download_rate: u64,
    /// Minimum number of optimistic unchoke slots per round.
    pub optimistic_slots: usize,
    /// Whether to advertise DHT support in handshakes.
    pub dht: bool,
    /// UDP port for the DHT collaborator.
    pub dht_port: u16,
    /// Where the file I/O collaborator places payload data.
    pub download_dir: PathBuf,
    /// Where the persistence collaborator keeps sidecar state.
    pub dotdir: PathBuf,
    /// Connection slot budget across all torrents.
    pub max_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            listen_ip: None,
            max_upload_slots: UploadSlots::Auto,
            max_upload_rate: 0,
            max_download_rate: 0,
            optimistic_slots: 1,
            dht: false,
            dht_port: 6882,
            download_dir: PathBuf::from("."),
            dotdir: PathBuf::from(".rswarm"),
            max_peers: 40,
        }
    }
}

impl Config {
    /// Builds a config from `(key, value)` pairs, starting from defaults.
    ///
    /// Unknown keys are rejected rather than ignored so that a typo in a
    /// configuration file surfaces at startup instead of as a silently
    /// missing tunable.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "listen_port" => config.listen_port = parse(key, value)?,
                "listen_ip" => config.listen_ip = Some(parse(key, value)?),
                "max_upload_slots" => {
                    config.max_upload_slots = if value == "auto" {
                        UploadSlots::Auto
                    } else {
                        UploadSlots::Fixed(parse(key, value)?)
                    }
                }
                "max_upload_rate" => config.max_upload_rate = parse(key, value)?,
                "max_download_rate" => config.max_download_rate = parse(key, value)?,
                "optimistic_slots" => config.optimistic_slots = parse(key, value)?,
                "dht" => config.dht = parse(key, value)?,
                "dht_port" => config.dht_port = parse(key, value)?,
                "download_dir" => config.download_dir = PathBuf::from(value),
                "dotdir" => config.dotdir = PathBuf::from(value),
                "max_peers" => config.max_peers = parse(key, value)?,
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
