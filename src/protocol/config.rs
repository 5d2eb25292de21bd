use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Protocol configuration. Every timing of the coordination protocol lives
/// here so tests can shrink the windows; the defaults are the production
/// values.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upload endpoint accepting a single multipart POST.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Root directory of the persistent store.
    #[serde(default = "default_store_root")]
    pub store_root: String,
    /// Bus channel name all three contexts attach to.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Executor self-assertion tick.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long the coordinator waits after a probe before reading the flag.
    #[serde(default = "default_liveness_wait_ms")]
    pub liveness_wait_ms: u64,
    /// Backoff between background-retry registration attempts.
    #[serde(default = "default_register_retry_ms")]
    pub register_retry_ms: u64,
    /// Delay before the in-process host fires a registered trigger.
    #[serde(default = "default_trigger_delay_ms")]
    pub trigger_delay_ms: u64,
    /// Age past which a persisted-file lease is considered stale.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Failover attempts before the coordinator gives up with a terminal
    /// failure instead of re-arming the trigger.
    #[serde(default = "default_max_retry_cycles")]
    pub max_retry_cycles: u32,
}

fn default_endpoint() -> String {
    "http://localhost:3003/api/upload/file".to_string()
}

fn default_store_root() -> String {
    ".uplink".to_string()
}

fn default_channel() -> String {
    "workerChannel".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_liveness_wait_ms() -> u64 {
    2_000
}

fn default_register_retry_ms() -> u64 {
    10_000
}

fn default_trigger_delay_ms() -> u64 {
    3_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_max_retry_cycles() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: default_endpoint(),
            store_root: default_store_root(),
            channel: default_channel(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_wait_ms: default_liveness_wait_ms(),
            register_retry_ms: default_register_retry_ms(),
            trigger_delay_ms: default_trigger_delay_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            max_retry_cycles: default_max_retry_cycles(),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_wait(&self) -> Duration {
        Duration::from_millis(self.liveness_wait_ms)
    }

    pub fn register_retry(&self) -> Duration {
        Duration::from_millis(self.register_retry_ms)
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
