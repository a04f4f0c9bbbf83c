use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by the tracker and peer binaries. These are deployment
/// policy; changing them never changes the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// milliseconds since the last heartbeat before a seeder counts as dead
    pub seeder_timeout_ms: u64,
    /// cadence of `active` announcements while seeding
    pub heartbeat_interval_ms: u64,
    /// discovery queries to spend before giving up on a file
    pub discovery_attempts: u32,
    /// pause between discovery attempts
    pub discovery_backoff_ms: u64,
    /// how long a single discovery attempt waits for a tracker reply
    pub reply_wait_ms: u64,
    /// connect and read bound on the direct transfer
    pub transfer_timeout_ms: u64,
    /// where seed files are read from and downloads are written to
    pub db_dir: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            seeder_timeout_ms: 2_000,
            heartbeat_interval_ms: 500,
            discovery_attempts: 5,
            discovery_backoff_ms: 1_000,
            reply_wait_ms: 1_000,
            transfer_timeout_ms: 5_000,
            db_dir: "db".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads a TOML config file; missing keys fall back to the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn seeder_timeout(&self) -> Duration {
        Duration::from_millis(self.seeder_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_ms)
    }

    pub fn reply_wait(&self) -> Duration {
        Duration::from_millis(self.reply_wait_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}
