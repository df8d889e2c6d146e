//! # Configuration Management Module
//!
//! Type-safe TOML configuration for the bridge with defaults for every option
//! and a `validate()` pass that rejects values the pipeline cannot run with
//! (zero-sized queues, zero rate limits and similar).
//!
//! ## Configuration Structure
//!
//! - [`BridgeConfig`] - relay, dedup, movement, live buffer and worker settings
//! - [`StorageConfig`] - database location and connection pool
//! - [`MaintenanceConfig`] - retention and optimization cycle
//! - [`RadioConfig`] - where radio events are read from
//! - [`LoggingConfig`] - log level and files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Bridge: {}", config.bridge.name);
//!     println!("Database: {}", config.storage.db_path);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [bridge]
//! name = "Mesh Bridge"
//! movement_threshold_meters = 100.0
//! dedup_window_seconds = 20
//! relay_rate_per_minute = 60
//!
//! [storage]
//! db_path = "data/meshbridge.db"
//!
//! [maintenance]
//! retention_days = 30
//! ```
//!
//! Every section is optional; missing keys fall back to the defaults below.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub name: String,
    /// Node id of the local radio, used to skip our own echoes
    pub node_id: String,
    /// A node counts as active if heard within this many minutes
    pub active_node_threshold_minutes: u64,
    pub movement_threshold_meters: f64,
    /// Maximum characters in a message sent toward the mesh
    pub message_max_length: usize,
    pub command_cooldown_seconds: u64,
    pub relay_rate_per_minute: u32,
    pub dedup_window_seconds: u64,
    pub live_buffer_cap: usize,
    pub live_window_seconds: u64,
    pub ingest_queue_capacity: usize,
    pub ingest_workers: usize,
    pub query_cache_ttl_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "Mesh Bridge".to_string(),
            node_id: String::new(),
            active_node_threshold_minutes: 60,
            movement_threshold_meters: 100.0,
            message_max_length: 225,
            command_cooldown_seconds: 2,
            relay_rate_per_minute: 60,
            dedup_window_seconds: 20,
            live_buffer_cap: 1000,
            live_window_seconds: 60,
            ingest_queue_capacity: 1024,
            ingest_workers: 4,
            query_cache_ttl_seconds: 60,
        }
    }
}

impl BridgeConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_seconds)
    }

    pub fn command_cooldown(&self) -> Duration {
        Duration::from_secs(self.command_cooldown_seconds)
    }

    pub fn live_window(&self) -> Duration {
        Duration::from_secs(self.live_window_seconds)
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Size of the round-robin reader pool (the writer is separate)
    pub read_connections: usize,
    pub busy_timeout_ms: u64,
    /// How long `close()` waits for in-flight writes
    pub drain_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/meshbridge.db".to_string(),
            read_connections: 4,
            busy_timeout_ms: 30_000,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub retention_days: u32,
    pub vacuum_threshold_mb: u64,
    pub join_timeout_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
            retention_days: 30,
            vacuum_threshold_mb: 100,
            join_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// "-" reads JSON-lines events from stdin, anything else is a file path
    pub source: String,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            source: "-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshbridge.log".to_string()),
            security_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the pipeline cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let b = &self.bridge;
        let checks: [(bool, &str); 9] = [
            (b.live_buffer_cap == 0, "bridge.live_buffer_cap must be > 0"),
            (b.ingest_queue_capacity == 0, "bridge.ingest_queue_capacity must be > 0"),
            (b.ingest_workers == 0, "bridge.ingest_workers must be > 0"),
            (b.relay_rate_per_minute == 0, "bridge.relay_rate_per_minute must be > 0"),
            (b.message_max_length == 0, "bridge.message_max_length must be > 0"),
            (
                !(b.movement_threshold_meters.is_finite() && b.movement_threshold_meters > 0.0),
                "bridge.movement_threshold_meters must be a positive number",
            ),
            (self.storage.read_connections == 0, "storage.read_connections must be > 0"),
            (
                self.maintenance.enabled && self.maintenance.interval_seconds == 0,
                "maintenance.interval_seconds must be > 0",
            ),
            (self.maintenance.retention_days == 0, "maintenance.retention_days must be > 0"),
        ];
        for (bad, msg) in checks {
            if bad {
                return Err(anyhow!("Invalid configuration: {}", msg));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.bridge.active_node_threshold_minutes, 60);
        assert_eq!(config.bridge.movement_threshold_meters, 100.0);
        assert_eq!(config.bridge.message_max_length, 225);
        assert_eq!(config.bridge.command_cooldown(), Duration::from_secs(2));
        assert_eq!(config.bridge.relay_rate_per_minute, 60);
        assert_eq!(config.bridge.dedup_window(), Duration::from_secs(20));
        assert_eq!(config.bridge.live_buffer_cap, 1000);
        assert_eq!(config.maintenance.retention_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let text = r#"
            [bridge]
            dedup_window_seconds = 5

            [storage]
            db_path = "/tmp/x.db"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.bridge.dedup_window_seconds, 5);
        assert_eq!(config.bridge.relay_rate_per_minute, 60);
        assert_eq!(config.storage.db_path, "/tmp/x.db");
        assert_eq!(config.storage.read_connections, 4);
        assert!(config.maintenance.enabled);
        assert_eq!(config.radio.source, "-");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.bridge.live_buffer_cap = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bridge.relay_rate_per_minute = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bridge.movement_threshold_meters = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.maintenance.enabled = false;
        config.maintenance.interval_seconds = 0;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_create_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.bridge.name, "Mesh Bridge");
        assert_eq!(loaded.storage.busy_timeout_ms, 30_000);
    }
}
