//! Row types shared between the ingest path and the engines.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Which metric table a sample lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    System,
    Network,
}

impl MetricSource {
    pub fn table(&self) -> &'static str {
        match self {
            MetricSource::System => "system_metrics",
            MetricSource::Network => "network_metrics",
        }
    }
}

/// One numeric sample destined for a raw metric table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix seconds.
    pub timestamp: i64,
    pub source: MetricSource,
    pub metric_name: String,
    pub value: f64,
}

impl MetricSample {
    pub fn now(source: MetricSource, metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            source,
            metric_name: metric_name.into(),
            value,
        }
    }
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Unix seconds.
    pub timestamp: i64,
    /// Which configured log source produced this line.
    pub source: String,
    pub message: String,
    /// Syslog-style level: DEBUG, INFO, WARNING, ERROR, CRITICAL.
    pub level: String,
    pub ip_address: Option<String>,
    pub user: Option<String>,
    pub service: Option<String>,
    /// Normalized action tag, e.g. "ban", "failed_login", "accepted_login".
    pub action: Option<String>,
    /// Parser-specific extras, stored as JSON.
    pub metadata: Option<serde_json::Value>,
}

impl LogEvent {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            source: source.into(),
            message: message.into(),
            level: "INFO".to_string(),
            ip_address: None,
            user: None,
            service: None,
            action: None,
            metadata: None,
        }
    }
}

/// A stored log event together with its rowid, as read back by the
/// correlation engine.
#[derive(Debug, Clone)]
pub struct StoredLogEvent {
    pub id: i64,
    pub event: LogEvent,
}

/// A structured fact extracted from log events, written by the correlation
/// engine or presented directly by an external collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub source: String,
    pub detail: TraceDetail,
}

/// Which trace table a record lands in, with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TraceDetail {
    Event {
        action: Option<String>,
        severity: f64,
        ip_address: Option<String>,
        service: Option<String>,
        user: Option<String>,
        message: String,
    },
    Process {
        pid: i64,
        name: Option<String>,
        details: Option<String>,
    },
    Network {
        ip_address: String,
        port: Option<i64>,
        details: Option<String>,
    },
    Error {
        level: String,
        message: String,
        severity: f64,
    },
}

/// Per-IP reputation state as read from the `ip_reputation` table.
#[derive(Debug, Clone, PartialEq)]
pub struct IpReputation {
    pub ip_address: String,
    pub threat_score: f64,
    pub failed_login_count: i64,
    pub ban_count: i64,
    pub event_count: i64,
    pub is_malicious: bool,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// A detected recurring event pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct TracePattern {
    pub signature: String,
    pub window_secs: i64,
    pub occurrence_count: i64,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// One aggregate row for a metric and time window.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub metric_name: String,
    /// Window start, aligned: `timestamp - timestamp % resolution`.
    pub window_start: i64,
    pub sample_count: i64,
    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    pub sum_value: f64,
}
