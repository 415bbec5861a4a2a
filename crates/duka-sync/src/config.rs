//! # Engine Configuration
//!
//! Configuration for the offline sale engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DUKA_DEVICE_ID=till-01                                             │
//! │     DUKA_SYNC_INTERVAL_SECS=30                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/pos/engine.toml (Linux)                                  │
//! │     ~/Library/Application Support/com.duka.pos/engine.toml (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # engine.toml
//! [device]
//! id = "till-01"
//! name = "Front counter"
//!
//! [ledger]
//! max_entries = 100
//! storage_budget_bytes = 5242880
//! retention_days = 7
//!
//! [sync]
//! interval_secs = 30
//! max_attempts = 3
//!
//! [storage]
//! local_db_path = "device.db"
//! remote_db_path = "remote.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use duka_core::retention::RetentionPolicy;
use duka_core::{DEFAULT_STORAGE_BUDGET_BYTES, MAX_LEDGER_ENTRIES, MAX_SYNC_ATTEMPTS};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this till.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Front counter").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Till".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Ledger Settings
// =============================================================================

/// Size and retention limits of the device ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Hard cap on queued records.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Byte budget of the serialized ledger.
    #[serde(default = "default_storage_budget")]
    pub storage_budget_bytes: usize,

    /// Synced records older than this are purged by the standard tier.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Minimum gap between debounced cleanup passes.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Unsynced records kept by the emergency tier.
    #[serde(default = "default_tier_keep")]
    pub emergency_keep: usize,

    /// Overall cap applied by the aggressive tier.
    #[serde(default = "default_tier_keep")]
    pub aggressive_keep: usize,

    /// Synced records older than this are purged by the aggressive tier.
    #[serde(default = "default_aggressive_retention_hours")]
    pub aggressive_retention_hours: u32,

    /// Keep committed records as `Synced` history instead of deleting them.
    #[serde(default)]
    pub retain_synced: bool,
}

fn default_max_entries() -> usize {
    MAX_LEDGER_ENTRIES
}
fn default_storage_budget() -> usize {
    DEFAULT_STORAGE_BUDGET_BYTES
}
fn default_retention_days() -> u32 {
    7
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_tier_keep() -> usize {
    50
}
fn default_aggressive_retention_hours() -> u32 {
    24
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            max_entries: default_max_entries(),
            storage_budget_bytes: default_storage_budget(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            emergency_keep: default_tier_keep(),
            aggressive_keep: default_tier_keep(),
            aggressive_retention_hours: default_aggressive_retention_hours(),
            retain_synced: false,
        }
    }
}

impl LedgerSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Scheduler timing and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Master switch. When false the scheduler never starts its loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Periodic tick.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Wait after a connectivity-restored event before draining.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// A commit slower than this counts as a transient failure.
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_secs: u64,

    /// Attempts before a record becomes terminally `Failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    30
}
fn default_settle_delay() -> u64 {
    1_000
}
fn default_commit_timeout() -> u64 {
    15
}
fn default_max_attempts() -> u32 {
    MAX_SYNC_ATTEMPTS
}
fn default_initial_backoff() -> u64 {
    2_000
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: true,
            interval_secs: default_interval(),
            settle_delay_ms: default_settle_delay(),
            commit_timeout_secs: default_commit_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Reversal Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalSettings {
    /// How far after the sale time the timestamp lookup still accepts a
    /// stock-out row.
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_secs: u64,
}

fn default_timestamp_tolerance() -> u64 {
    60
}

impl Default for ReversalSettings {
    fn default() -> Self {
        ReversalSettings {
            timestamp_tolerance_secs: default_timestamp_tolerance(),
        }
    }
}

impl ReversalSettings {
    pub fn timestamp_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timestamp_tolerance_secs as i64)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where the two databases live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Device database holding the ledger blob.
    #[serde(default = "default_local_db")]
    pub local_db_path: PathBuf,

    /// Reference remote ledger database.
    #[serde(default = "default_remote_db")]
    pub remote_db_path: PathBuf,
}

fn default_local_db() -> PathBuf {
    PathBuf::from("duka_device.db")
}
fn default_remote_db() -> PathBuf {
    PathBuf::from("duka_remote.db")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            local_db_path: default_local_db(),
            remote_db_path: default_remote_db(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
///
/// ## Example Config File
/// ```toml
/// [device]
/// id = "till-01"
/// name = "Front counter"
///
/// [ledger]
/// max_entries = 100
/// storage_budget_bytes = 5242880
/// retention_days = 7
/// cleanup_interval_secs = 300
/// retain_synced = false
///
/// [sync]
/// enabled = true
/// interval_secs = 30
/// settle_delay_ms = 1000
/// commit_timeout_secs = 15
/// max_attempts = 3
///
/// [reversal]
/// timestamp_tolerance_secs = 60
///
/// [storage]
/// local_db_path = "/var/lib/duka/device.db"
/// remote_db_path = "/var/lib/duka/remote.db"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub reversal: ReversalSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl EngineConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (engine.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.ledger.max_entries == 0 {
            return Err(SyncError::InvalidConfig(
                "ledger.max_entries must be greater than 0".into(),
            ));
        }

        if self.ledger.storage_budget_bytes == 0 {
            return Err(SyncError::InvalidConfig(
                "ledger.storage_budget_bytes must be greater than 0".into(),
            ));
        }

        if self.ledger.emergency_keep == 0 || self.ledger.emergency_keep > self.ledger.max_entries {
            return Err(SyncError::InvalidConfig(format!(
                "ledger.emergency_keep must be between 1 and max_entries ({})",
                self.ledger.max_entries
            )));
        }

        if self.sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_attempts must be greater than 0".into(),
            ));
        }

        if self.sync.commit_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.commit_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.initial_backoff() > self.sync.max_backoff() {
            return Err(SyncError::InvalidConfig(
                "sync.initial_backoff_ms must not exceed sync.max_backoff_secs".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("DUKA_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(secs) = std::env::var("DUKA_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid DUKA_SYNC_INTERVAL_SECS"),
            }
        }

        if let Ok(bytes) = std::env::var("DUKA_STORAGE_BUDGET_BYTES") {
            match bytes.parse::<usize>() {
                Ok(b) => self.ledger.storage_budget_bytes = b,
                Err(_) => warn!(value = %bytes, "Ignoring invalid DUKA_STORAGE_BUDGET_BYTES"),
            }
        }

        if let Ok(path) = std::env::var("DUKA_LOCAL_DB") {
            debug!(path = %path, "Overriding local database from environment");
            self.storage.local_db_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("DUKA_REMOTE_DB") {
            debug!(path = %path, "Overriding remote database from environment");
            self.storage.remote_db_path = PathBuf::from(path);
        }

        if let Ok(enabled) = std::env::var("DUKA_SYNC_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.sync.enabled = true,
                "0" | "false" | "no" | "off" => self.sync.enabled = false,
                _ => warn!(value = %enabled, "Unknown DUKA_SYNC_ENABLED value"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "duka", "pos")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Cleanup thresholds as the pure retention functions expect them.
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_entries: self.ledger.max_entries,
            retention: chrono::Duration::days(self.ledger.retention_days as i64),
            aggressive_retention: chrono::Duration::hours(
                self.ledger.aggressive_retention_hours as i64,
            ),
            aggressive_keep: self.ledger.aggressive_keep,
            emergency_keep: self.ledger.emergency_keep,
            max_attempts: self.sync.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.ledger.max_entries, 100);
        assert_eq!(config.ledger.storage_budget_bytes, 5 * 1024 * 1024);
        assert_eq!(config.sync.interval(), Duration::from_secs(30));
        assert_eq!(config.sync.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.sync.max_attempts, 3);
        assert!(!config.ledger.retain_synced);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.device.id = "  ".to_string();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "till-01".to_string();
        config.sync.max_attempts = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.max_attempts = 3;
        config.ledger.emergency_keep = 500;
        assert!(config.validate().is_err());

        config.ledger.emergency_keep = 50;
        config.sync.initial_backoff_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [device]
            id = "till-07"

            [sync]
            interval_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.device.id, "till-07");
        assert_eq!(config.device.name, "POS Till");
        assert_eq!(config.sync.interval_secs, 10);
        assert_eq!(config.sync.commit_timeout_secs, 15);
        assert_eq!(config.reversal.timestamp_tolerance_secs, 60);
    }

    #[test]
    fn test_retention_policy_mapping() {
        let mut config = EngineConfig::default();
        config.ledger.retention_days = 3;
        config.ledger.aggressive_retention_hours = 12;

        let policy = config.retention_policy();
        assert_eq!(policy.retention, chrono::Duration::days(3));
        assert_eq!(policy.aggressive_retention, chrono::Duration::hours(12));
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn test_toml_serialization() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[ledger]"));
        assert!(toml_str.contains("[storage]"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = EngineConfig::default();
        config.device.id = "till-09".into();
        config.sync.interval_secs = 45;
        config.save(Some(path.clone())).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.sync.interval_secs, 45);
    }
}
