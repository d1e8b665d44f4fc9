//! Application settings and TOML configuration parsing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Top-level Logly configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoglyConfig {
    /// Database location and retention policy.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Collection timer intervals.
    #[serde(default)]
    pub collection: CollectionConfig,

    /// System metric sampling.
    #[serde(default)]
    pub system: SystemConfig,

    /// Network counter sampling.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Log sources to tail and parse.
    #[serde(default)]
    pub logs: LogsConfig,

    /// Trace correlation, reputation, and pattern detection.
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Hourly/daily rollup scheduling.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Retention sweep scheduling.
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite storage file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Days to keep aggregate rows.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Days to keep raw metric, log, and trace rows.
    #[serde(default = "default_keep_raw_days")]
    pub keep_raw_data_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_metric_interval")]
    pub system_metrics_secs: u64,
    #[serde(default = "default_metric_interval")]
    pub network_metrics_secs: u64,
    #[serde(default = "default_log_interval")]
    pub log_parsing_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One tailed log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Source name -> file location. Source names are part of the ingest
    /// contract: rows with unknown sources are rejected.
    #[serde(default = "default_log_sources")]
    pub sources: BTreeMap<String, LogSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// How often the correlation cycle runs.
    #[serde(default = "default_log_interval")]
    pub interval_secs: u64,
    /// Events for the same key within this window share a trace.
    #[serde(default = "default_correlation_window")]
    pub window_secs: i64,
    /// A trace closes after this much inactivity.
    #[serde(default = "default_idle_close")]
    pub idle_close_secs: i64,
    /// Rows with timestamps further in the future than this are rejected.
    #[serde(default = "default_clock_skew")]
    pub max_clock_skew_secs: i64,
    /// Occurrences inside the pattern window that flag a pattern.
    #[serde(default = "default_pattern_threshold")]
    pub pattern_threshold: i64,
    /// Sliding window for pattern detection.
    #[serde(default = "default_pattern_window")]
    pub pattern_window_secs: i64,
    /// Maximum log events processed per source per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hourly_interval")]
    pub hourly_interval_secs: u64,
    #[serde(default = "default_daily_interval")]
    pub daily_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_daily_interval")]
    pub interval_secs: u64,
    /// Rows deleted per committed batch during a sweep.
    #[serde(default = "default_retention_batch")]
    pub batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/share/logly/logly.db")
}

fn default_retention_days() -> i64 {
    90
}

fn default_keep_raw_days() -> i64 {
    7
}

fn default_metric_interval() -> u64 {
    60
}

fn default_log_interval() -> u64 {
    300
}

fn default_correlation_window() -> i64 {
    300
}

fn default_idle_close() -> i64 {
    600
}

fn default_clock_skew() -> i64 {
    300
}

fn default_pattern_threshold() -> i64 {
    3
}

fn default_pattern_window() -> i64 {
    300
}

fn default_batch_size() -> usize {
    1000
}

fn default_hourly_interval() -> u64 {
    3600
}

fn default_daily_interval() -> u64 {
    86_400
}

fn default_retention_batch() -> usize {
    500
}

fn default_log_sources() -> BTreeMap<String, LogSourceConfig> {
    let mut sources = BTreeMap::new();
    sources.insert(
        "fail2ban".to_string(),
        LogSourceConfig {
            path: PathBuf::from("/var/log/fail2ban.log"),
            enabled: true,
        },
    );
    sources.insert(
        "syslog".to_string(),
        LogSourceConfig {
            path: PathBuf::from("/var/log/syslog"),
            enabled: true,
        },
    );
    sources.insert(
        "auth".to_string(),
        LogSourceConfig {
            path: PathBuf::from("/var/log/auth.log"),
            enabled: true,
        },
    );
    sources
}

impl Default for LoglyConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            collection: CollectionConfig::default(),
            system: SystemConfig::default(),
            network: NetworkConfig::default(),
            logs: LogsConfig::default(),
            correlation: CorrelationConfig::default(),
            aggregation: AggregationConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retention_days: default_retention_days(),
            keep_raw_data_days: default_keep_raw_days(),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            system_metrics_secs: default_metric_interval(),
            network_metrics_secs: default_metric_interval(),
            log_parsing_secs: default_log_interval(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: default_log_sources(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_log_interval(),
            window_secs: default_correlation_window(),
            idle_close_secs: default_idle_close(),
            max_clock_skew_secs: default_clock_skew(),
            pattern_threshold: default_pattern_threshold(),
            pattern_window_secs: default_pattern_window(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hourly_interval_secs: default_hourly_interval(),
            daily_interval_secs: default_daily_interval(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_daily_interval(),
            batch_size: default_retention_batch(),
        }
    }
}

impl LoglyConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: LoglyConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Names of enabled log sources, in stable order.
    pub fn enabled_log_sources(&self) -> Vec<String> {
        if !self.logs.enabled {
            return Vec::new();
        }
        self.logs
            .sources
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Partial configuration used for explicit overrides (CLI flags, tests).
///
/// Every leaf is enumerated; `apply` is total over the fields below, so a
/// field added to the config without a matching arm here fails to compile
/// rather than silently falling through.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoglyConfigOverlay {
    pub database_path: Option<PathBuf>,
    pub retention_days: Option<i64>,
    pub keep_raw_data_days: Option<i64>,
    pub system_metrics_secs: Option<u64>,
    pub network_metrics_secs: Option<u64>,
    pub log_parsing_secs: Option<u64>,
    pub system_enabled: Option<bool>,
    pub network_enabled: Option<bool>,
    pub logs_enabled: Option<bool>,
    pub log_sources: Option<BTreeMap<String, LogSourceConfig>>,
    pub correlation_interval_secs: Option<u64>,
    pub correlation_window_secs: Option<i64>,
    pub idle_close_secs: Option<i64>,
    pub max_clock_skew_secs: Option<i64>,
    pub pattern_threshold: Option<i64>,
    pub pattern_window_secs: Option<i64>,
    pub correlation_batch_size: Option<usize>,
    pub aggregation_enabled: Option<bool>,
    pub hourly_interval_secs: Option<u64>,
    pub daily_interval_secs: Option<u64>,
    pub retention_interval_secs: Option<u64>,
    pub retention_batch_size: Option<usize>,
}

impl LoglyConfigOverlay {
    /// Overlay the set fields onto `base`, leaving the rest untouched.
    pub fn apply(self, base: LoglyConfig) -> LoglyConfig {
        let LoglyConfigOverlay {
            database_path,
            retention_days,
            keep_raw_data_days,
            system_metrics_secs,
            network_metrics_secs,
            log_parsing_secs,
            system_enabled,
            network_enabled,
            logs_enabled,
            log_sources,
            correlation_interval_secs,
            correlation_window_secs,
            idle_close_secs,
            max_clock_skew_secs,
            pattern_threshold,
            pattern_window_secs,
            correlation_batch_size,
            aggregation_enabled,
            hourly_interval_secs,
            daily_interval_secs,
            retention_interval_secs,
            retention_batch_size,
        } = self;

        let mut config = base;
        if let Some(v) = database_path {
            config.database.path = v;
        }
        if let Some(v) = retention_days {
            config.database.retention_days = v;
        }
        if let Some(v) = keep_raw_data_days {
            config.database.keep_raw_data_days = v;
        }
        if let Some(v) = system_metrics_secs {
            config.collection.system_metrics_secs = v;
        }
        if let Some(v) = network_metrics_secs {
            config.collection.network_metrics_secs = v;
        }
        if let Some(v) = log_parsing_secs {
            config.collection.log_parsing_secs = v;
        }
        if let Some(v) = system_enabled {
            config.system.enabled = v;
        }
        if let Some(v) = network_enabled {
            config.network.enabled = v;
        }
        if let Some(v) = logs_enabled {
            config.logs.enabled = v;
        }
        if let Some(v) = log_sources {
            config.logs.sources = v;
        }
        if let Some(v) = correlation_interval_secs {
            config.correlation.interval_secs = v;
        }
        if let Some(v) = correlation_window_secs {
            config.correlation.window_secs = v;
        }
        if let Some(v) = idle_close_secs {
            config.correlation.idle_close_secs = v;
        }
        if let Some(v) = max_clock_skew_secs {
            config.correlation.max_clock_skew_secs = v;
        }
        if let Some(v) = pattern_threshold {
            config.correlation.pattern_threshold = v;
        }
        if let Some(v) = pattern_window_secs {
            config.correlation.pattern_window_secs = v;
        }
        if let Some(v) = correlation_batch_size {
            config.correlation.batch_size = v;
        }
        if let Some(v) = aggregation_enabled {
            config.aggregation.enabled = v;
        }
        if let Some(v) = hourly_interval_secs {
            config.aggregation.hourly_interval_secs = v;
        }
        if let Some(v) = daily_interval_secs {
            config.aggregation.daily_interval_secs = v;
        }
        if let Some(v) = retention_interval_secs {
            config.retention.interval_secs = v;
        }
        if let Some(v) = retention_batch_size {
            config.retention.batch_size = v;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config: LoglyConfig = toml::from_str("").unwrap();
        assert_eq!(config.database.retention_days, 90);
        assert_eq!(config.database.keep_raw_data_days, 7);
        assert_eq!(config.collection.system_metrics_secs, 60);
        assert_eq!(config.collection.log_parsing_secs, 300);
        assert_eq!(config.correlation.pattern_threshold, 3);
        assert!(config.logs.sources.contains_key("fail2ban"));
        assert!(config.logs.sources.contains_key("auth"));
        assert!(config.logs.sources.contains_key("syslog"));
    }

    #[test]
    fn parses_partial_sections_from_toml() {
        let toml_str = r#"
[database]
retention_days = 30

[correlation]
pattern_threshold = 5
window_secs = 120

[logs.sources.nginx]
path = "/var/log/nginx/access.log"
"#;
        let config: LoglyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.retention_days, 30);
        // Unset fields in a present section still get defaults.
        assert_eq!(config.database.keep_raw_data_days, 7);
        assert_eq!(config.correlation.pattern_threshold, 5);
        assert_eq!(config.correlation.window_secs, 120);
        assert!(config.logs.sources.contains_key("nginx"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = LoglyConfig::load(Path::new("/nonexistent/logly.toml")).unwrap();
        assert_eq!(config.database.retention_days, 90);
    }

    #[test]
    fn overlay_replaces_only_set_fields() {
        let overlay = LoglyConfigOverlay {
            retention_days: Some(14),
            pattern_threshold: Some(10),
            ..Default::default()
        };
        let config = overlay.apply(LoglyConfig::default());
        assert_eq!(config.database.retention_days, 14);
        assert_eq!(config.correlation.pattern_threshold, 10);
        // Everything else untouched.
        assert_eq!(config.database.keep_raw_data_days, 7);
        assert_eq!(config.correlation.window_secs, 300);
    }

    #[test]
    fn enabled_sources_respects_flags() {
        let mut config = LoglyConfig::default();
        config.logs.sources.get_mut("syslog").unwrap().enabled = false;
        let sources = config.enabled_log_sources();
        assert!(sources.contains(&"fail2ban".to_string()));
        assert!(!sources.contains(&"syslog".to_string()));

        config.logs.enabled = false;
        assert!(config.enabled_log_sources().is_empty());
    }
}
