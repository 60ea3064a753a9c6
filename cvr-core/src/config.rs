//! Configuration for the CVR ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name (used in log output)
    pub service_name: String,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Matching engine configuration
    pub matching: MatchingConfig,

    /// Period reporting configuration
    pub reporting: ReportingConfig,

    /// Logging configuration
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "cvr-core".to_string(),
            storage: StorageConfig::default(),
            matching: MatchingConfig::default(),
            reporting: ReportingConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep the ledger in RocksDB (otherwise memory only)
    pub persistent: bool,

    /// RocksDB directory
    pub data_dir: PathBuf,

    /// Open the database read-only (reporting replicas); every write fails
    pub read_only: bool,

    /// fsync the WAL on every committed batch
    pub sync_writes: bool,

    /// RocksDB tuning
    pub rocksdb: RocksDBConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            data_dir: PathBuf::from("./data/cvr"),
            read_only: false,
            sync_writes: true,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Matching engine configuration
///
/// All scores are on the 0-100 confidence scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// PO match at or above this score may be confirmed automatically
    pub auto_threshold: f64,

    /// PO match at or above this score needs review
    pub review_threshold: f64,

    /// Fuzzy PO candidates below this score are discarded
    pub candidate_floor: f64,

    /// Default threshold for the certificate auto-match batch
    pub auto_match_threshold: f64,

    /// Certificate older than this many days (vs invoice date) raises a warning
    pub stale_certificate_days: i64,

    /// Reverse the invoice actual when a PO match is undone
    pub reverse_actual_on_unmatch: bool,

    /// User recorded on matches confirmed by the batch
    pub system_user: String,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            auto_threshold: 90.0,
            review_threshold: 60.0,
            candidate_floor: 30.0,
            auto_match_threshold: 85.0,
            stale_certificate_days: 60,
            reverse_actual_on_unmatch: false,
            system_user: "system:auto-match".to_string(),
        }
    }
}

/// Period reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Run the periodic snapshot scheduler
    pub enabled: bool,

    /// Seconds between scheduled snapshots
    pub interval_secs: u64,

    /// User recorded on scheduled reports
    pub system_user: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 86_400, // daily
            system_user: "system:period-scheduler".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub log_level: String,

    /// Emit JSON log lines
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("CVR_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
            config.storage.persistent = true;
        }

        if let Ok(value) = std::env::var("CVR_AUTO_MATCH_THRESHOLD") {
            config.matching.auto_match_threshold = value.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid CVR_AUTO_MATCH_THRESHOLD '{}': {}", value, e))
            })?;
        }

        if let Ok(value) = std::env::var("CVR_REVERSE_ON_UNMATCH") {
            config.matching.reverse_actual_on_unmatch = parse_bool("CVR_REVERSE_ON_UNMATCH", &value)?;
        }

        if let Ok(value) = std::env::var("CVR_REPORT_INTERVAL_SECS") {
            config.reporting.interval_secs = value.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid CVR_REPORT_INTERVAL_SECS '{}': {}", value, e))
            })?;
            config.reporting.enabled = true;
        }

        if let Ok(level) = std::env::var("CVR_LOG_LEVEL") {
            config.telemetry.log_level = level;
        }

        if let Ok(value) = std::env::var("CVR_LOG_JSON") {
            config.telemetry.json = parse_bool("CVR_LOG_JSON", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        let m = &self.matching;
        let ordered = 0.0 <= m.candidate_floor
            && m.candidate_floor <= m.review_threshold
            && m.review_threshold <= m.auto_threshold
            && m.auto_threshold <= 100.0;
        if !ordered {
            return Err(crate::Error::Config(format!(
                "Matching thresholds must satisfy 0 <= floor ({}) <= review ({}) <= auto ({}) <= 100",
                m.candidate_floor, m.review_threshold, m.auto_threshold
            )));
        }

        if !(0.0..=100.0).contains(&m.auto_match_threshold) {
            return Err(crate::Error::Config(format!(
                "auto_match_threshold must be within 0..=100, got {}",
                m.auto_match_threshold
            )));
        }

        if self.reporting.interval_secs == 0 {
            return Err(crate::Error::Config(
                "reporting.interval_secs must be positive".to_string(),
            ));
        }

        if self.storage.persistent && self.storage.rocksdb.write_buffer_size_mb == 0 {
            return Err(crate::Error::Config(
                "storage.rocksdb.write_buffer_size_mb must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> crate::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(crate::Error::Config(format!("Invalid {} '{}'", name, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "cvr-core");
        assert!(!config.storage.persistent);
        assert_eq!(config.matching.auto_threshold, 90.0);
        assert!(!config.matching.reverse_actual_on_unmatch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [matching]
            auto_match_threshold = 95.0
            reverse_actual_on_unmatch = true

            [storage]
            data_dir = "/var/lib/cvr"
            "#,
        )
        .unwrap();

        assert_eq!(config.matching.auto_match_threshold, 95.0);
        assert!(config.matching.reverse_actual_on_unmatch);
        assert_eq!(config.matching.review_threshold, 60.0);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/cvr"));
        assert!(config.storage.sync_writes);
        assert_eq!(config.storage.rocksdb.write_buffer_size_mb, 64);
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut config = Config::default();
        config.matching.review_threshold = 95.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
