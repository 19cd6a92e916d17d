//! Configuration system for beamdrop.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BEAMDROP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/beamdrop/config.toml
//!   3. ~/.config/beamdrop/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{CHANNEL_PSM, SERVICE_UUID};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamdropConfig {
    pub discovery: DiscoveryConfig,
    pub link: LinkConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Radio service identifier scanned for and advertised.
    pub service_uuid: String,
    /// UDP port advertisements are sent to and received on.
    pub advertise_port: u16,
    /// Network interface carrying advertisements. Empty = system default.
    pub interface: String,
    /// Seconds between advertisements.
    pub announce_interval_secs: u64,
    /// Peers not seen within this window are dropped from the registry.
    pub peer_ttl_secs: u64,
    /// Maximum peers tracked at once. The stalest entry is evicted when full.
    pub max_peers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Logical channel identifier (PSM).
    pub channel_psm: u16,
    /// TCP port the emulated channel listens on. 0 = any free port.
    pub channel_port: u16,
    /// MTU offered by the receiving side of an emulated channel.
    pub mtu: u16,
    /// Bytes of every write kept unused on top of the frame tag.
    pub write_headroom: usize,
    /// Attempts allowed for the radio link and again for the channel.
    pub connect_attempts: u32,
    /// Wait of the first attempt, in milliseconds.
    pub connect_interval_ms: u64,
    /// Multiplier applied to the wait after each failed attempt. 1 = fixed.
    pub connect_backoff: u32,
    /// Upper bound on a single attempt's wait, in milliseconds.
    pub connect_max_interval_ms: u64,
    /// Pause between the channel opening and the first write.
    pub settle_ms: u64,
    /// Bound on every read of a response. 0 = wait forever.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// zlib level, 0-9.
    pub compression_level: u32,
    /// Where received files are written.
    pub receive_dir: PathBuf,
    /// Name advertised to nearby devices. Empty = hostname.
    pub device_name: String,
    /// Largest file accepted from a sender, before and after decompression.
    pub max_file_bytes: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID.to_string(),
            advertise_port: 9300,
            interface: String::new(),
            announce_interval_secs: 2,
            peer_ttl_secs: 30,
            max_peers: 64,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            channel_psm: CHANNEL_PSM,
            channel_port: 0,
            mtu: 512,
            write_headroom: 0,
            connect_attempts: 10,
            connect_interval_ms: 1000,
            connect_backoff: 1,
            connect_max_interval_ms: 8000,
            settle_ms: 200,
            read_timeout_ms: 10_000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            receive_dir: data_dir().join("received"),
            device_name: String::new(),
            max_file_bytes: 512 * 1024 * 1024,
        }
    }
}

impl LinkConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            interval: Duration::from_millis(self.connect_interval_ms),
            backoff: self.connect_backoff.max(1),
            max_interval: Duration::from_millis(self.connect_max_interval_ms),
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Bounded wait for an asynchronous condition: `attempts` waits, the first
/// lasting `interval`, each following one `backoff` times longer, capped at
/// `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub backoff: u32,
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Ten one-second attempts, no backoff.
    pub fn reference() -> Self {
        LinkConfig::default().retry_policy()
    }

    /// Wait allotted to the zero-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1).saturating_pow(attempt);
        self.interval.saturating_mul(factor).min(self.max_interval.max(self.interval))
    }

    /// Sum of every attempt's wait.
    pub fn budget(&self) -> Duration {
        let mut total = Duration::ZERO;
        for attempt in 0..self.attempts {
            total = total.saturating_add(self.delay(attempt));
            if total == Duration::MAX {
                break;
            }
        }
        total
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("beamdrop")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("beamdrop")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BeamdropConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BEAMDROP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&BeamdropConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply BEAMDROP_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.parse().ok())
        }

        if let Some(v) = parsed(lookup("BEAMDROP_DISCOVERY__ADVERTISE_PORT")) {
            self.discovery.advertise_port = v;
        }
        if let Some(v) = lookup("BEAMDROP_DISCOVERY__INTERFACE") {
            self.discovery.interface = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_DISCOVERY__PEER_TTL_SECS")) {
            self.discovery.peer_ttl_secs = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_LINK__CHANNEL_PORT")) {
            self.link.channel_port = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_LINK__MTU")) {
            self.link.mtu = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_LINK__WRITE_HEADROOM")) {
            self.link.write_headroom = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_LINK__CONNECT_ATTEMPTS")) {
            self.link.connect_attempts = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_LINK__READ_TIMEOUT_MS")) {
            self.link.read_timeout_ms = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_TRANSFER__COMPRESSION_LEVEL")) {
            self.transfer.compression_level = v;
        }
        if let Some(v) = lookup("BEAMDROP_TRANSFER__RECEIVE_DIR") {
            self.transfer.receive_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BEAMDROP_TRANSFER__DEVICE_NAME") {
            self.transfer.device_name = v;
        }
        if let Some(v) = parsed(lookup("BEAMDROP_TRANSFER__MAX_FILE_BYTES")) {
            self.transfer.max_file_bytes = v;
        }
    }
}
