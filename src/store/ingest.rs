//! Validated batch writes into the raw tables.
//!
//! Invalid rows are skipped and logged rather than failing the batch; one
//! malformed sample must not drop the rest of a collection cycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;

use crate::error::{LoglyError, Result};
use crate::store::models::{LogEvent, MetricSample, TraceDetail, TraceRecord};
use crate::store::Store;

/// Outcome of one batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub rejected: usize,
}

pub struct IngestWriter {
    store: Arc<Store>,
    /// Rows this far in the future are rejected as clock skew.
    max_clock_skew_secs: i64,
    /// Rows older than this many days are already past raw retention.
    keep_raw_data_days: i64,
    /// When set, log events from sources outside this list are rejected.
    known_sources: Option<BTreeSet<String>>,
}

impl IngestWriter {
    pub fn new(store: Arc<Store>, max_clock_skew_secs: i64, keep_raw_data_days: i64) -> Self {
        Self {
            store,
            max_clock_skew_secs,
            keep_raw_data_days,
            known_sources: None,
        }
    }

    /// Restrict log-event ingestion to the configured source names.
    pub fn with_known_sources(mut self, sources: impl IntoIterator<Item = String>) -> Self {
        self.known_sources = Some(sources.into_iter().collect());
        self
    }

    /// Insert one metric sample. A malformed sample is an error; use
    /// [`write_metrics`](Self::write_metrics) for skip-and-log batches.
    pub fn write_metric(&self, sample: &MetricSample) -> Result<()> {
        let now = Utc::now().timestamp();
        self.validate_timestamp(sample.timestamp, now)
            .map_err(|reason| LoglyError::DataIntegrity(reason.to_string()))?;
        if sample.metric_name.is_empty() || !sample.value.is_finite() {
            return Err(LoglyError::DataIntegrity(
                "empty metric name or non-finite value".to_string(),
            ));
        }
        self.store.with_retry(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (timestamp, metric_name, value) VALUES (?1, ?2, ?3)",
                    sample.source.table()
                ),
                rusqlite::params![sample.timestamp, sample.metric_name, sample.value],
            )?;
            Ok(())
        })
    }

    /// Insert one log event, rejecting malformed rows as errors.
    pub fn write_log_event(&self, event: &LogEvent) -> Result<()> {
        let now = Utc::now().timestamp();
        self.validate_log_event(event, now)
            .map_err(|reason| LoglyError::DataIntegrity(reason.to_string()))?;
        self.store.with_retry(|conn| insert_log_event(conn, event))
    }

    /// Insert one trace record into the table matching its payload.
    pub fn write_trace(&self, trace: &TraceRecord) -> Result<()> {
        let now = Utc::now().timestamp();
        if trace.trace_id.is_empty() {
            return Err(LoglyError::DataIntegrity("empty trace_id".to_string()));
        }
        if trace.source.trim().is_empty() {
            return Err(LoglyError::DataIntegrity("empty source".to_string()));
        }
        self.validate_timestamp(trace.timestamp, now)
            .map_err(|reason| LoglyError::DataIntegrity(reason.to_string()))?;
        self.store.with_retry(|conn| insert_trace(conn, trace))
    }

    /// Insert metric samples in a single transaction, routing each to its
    /// source table. Returns how many rows were written and skipped.
    pub fn write_metrics(&self, samples: &[MetricSample]) -> Result<IngestReport> {
        if samples.is_empty() {
            return Ok(IngestReport::default());
        }
        let now = Utc::now().timestamp();
        self.store.with_retry(|conn| {
            let mut report = IngestReport::default();
            let tx = conn.transaction()?;
            for sample in samples {
                if let Err(reason) = self.validate_timestamp(sample.timestamp, now) {
                    tracing::warn!(
                        metric = %sample.metric_name,
                        timestamp = sample.timestamp,
                        reason,
                        "rejected metric sample"
                    );
                    report.rejected += 1;
                    continue;
                }
                if sample.metric_name.is_empty() || !sample.value.is_finite() {
                    tracing::warn!(
                        metric = %sample.metric_name,
                        value = sample.value,
                        "rejected metric sample with empty name or non-finite value"
                    );
                    report.rejected += 1;
                    continue;
                }
                tx.execute(
                    &format!(
                        "INSERT INTO {} (timestamp, metric_name, value) VALUES (?1, ?2, ?3)",
                        sample.source.table()
                    ),
                    rusqlite::params![sample.timestamp, sample.metric_name, sample.value],
                )?;
                report.inserted += 1;
            }
            tx.commit()?;
            Ok(report)
        })
    }

    /// Insert parsed log events in a single transaction.
    pub fn write_log_events(&self, events: &[LogEvent]) -> Result<IngestReport> {
        if events.is_empty() {
            return Ok(IngestReport::default());
        }
        let now = Utc::now().timestamp();
        self.store.with_retry(|conn| {
            let mut report = IngestReport::default();
            let tx = conn.transaction()?;
            for event in events {
                if let Err(reason) = self.validate_log_event(event, now) {
                    tracing::warn!(
                        source = %event.source,
                        timestamp = event.timestamp,
                        reason,
                        "rejected log event"
                    );
                    report.rejected += 1;
                    continue;
                }
                insert_log_event(&tx, event)?;
                report.inserted += 1;
            }
            tx.commit()?;
            Ok(report)
        })
    }

    fn validate_log_event(&self, event: &LogEvent, now: i64) -> std::result::Result<(), &'static str> {
        if event.source.trim().is_empty() {
            return Err("empty source");
        }
        if let Some(known) = &self.known_sources {
            if !known.contains(&event.source) {
                return Err("unknown source");
            }
        }
        if event.message.is_empty() {
            return Err("empty message");
        }
        self.validate_timestamp(event.timestamp, now)
    }

    fn validate_timestamp(&self, timestamp: i64, now: i64) -> std::result::Result<(), &'static str> {
        if timestamp <= 0 {
            return Err("non-positive timestamp");
        }
        if timestamp > now + self.max_clock_skew_secs {
            return Err("timestamp beyond clock skew bound");
        }
        if timestamp < now - self.keep_raw_data_days * 86_400 {
            return Err("timestamp past raw retention boundary");
        }
        Ok(())
    }
}

fn insert_log_event(conn: &Connection, event: &LogEvent) -> Result<()> {
    let metadata = event
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| crate::error::LoglyError::DataIntegrity(e.to_string()))?;
    conn.execute(
        "INSERT INTO log_events
            (timestamp, source, message, level, ip_address, user, service, action, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            event.timestamp,
            event.source,
            event.message,
            event.level,
            event.ip_address,
            event.user,
            event.service,
            event.action,
            metadata,
        ],
    )?;
    Ok(())
}

fn insert_trace(conn: &Connection, trace: &TraceRecord) -> Result<()> {
    match &trace.detail {
        TraceDetail::Event {
            action,
            severity,
            ip_address,
            service,
            user,
            message,
        } => {
            conn.execute(
                "INSERT INTO event_traces
                    (trace_id, timestamp, source, action, severity,
                     ip_address, service, user, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    trace.trace_id,
                    trace.timestamp,
                    trace.source,
                    action,
                    severity,
                    ip_address,
                    service,
                    user,
                    message,
                ],
            )?;
        }
        TraceDetail::Process { pid, name, details } => {
            conn.execute(
                "INSERT INTO process_traces (trace_id, timestamp, pid, name, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![trace.trace_id, trace.timestamp, pid, name, details],
            )?;
        }
        TraceDetail::Network {
            ip_address,
            port,
            details,
        } => {
            conn.execute(
                "INSERT INTO network_traces (trace_id, timestamp, ip_address, port, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![trace.trace_id, trace.timestamp, ip_address, port, details],
            )?;
        }
        TraceDetail::Error {
            level,
            message,
            severity,
        } => {
            conn.execute(
                "INSERT INTO error_traces
                    (trace_id, timestamp, source, level, message, severity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    trace.trace_id,
                    trace.timestamp,
                    trace.source,
                    level,
                    message,
                    severity,
                ],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::MetricSource;

    fn writer() -> IngestWriter {
        let store = Arc::new(Store::open_in_memory().unwrap());
        IngestWriter::new(store, 300, 7)
    }

    fn count(writer: &IngestWriter, table: &str) -> i64 {
        writer
            .store
            .with_retry(|conn| {
                Ok(conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap()
    }

    #[test]
    fn metrics_route_to_their_source_table() {
        let writer = writer();
        let report = writer
            .write_metrics(&[
                MetricSample::now(MetricSource::System, "cpu_percent", 42.5),
                MetricSample::now(MetricSource::Network, "bytes_recv", 1024.0),
            ])
            .unwrap();
        assert_eq!(report, IngestReport { inserted: 2, rejected: 0 });
        assert_eq!(count(&writer, "system_metrics"), 1);
        assert_eq!(count(&writer, "network_metrics"), 1);
    }

    #[test]
    fn bad_rows_are_skipped_not_fatal() {
        let writer = writer();
        let now = Utc::now().timestamp();
        let future = MetricSample {
            timestamp: now + 3600,
            source: MetricSource::System,
            metric_name: "cpu_percent".to_string(),
            value: 1.0,
        };
        let stale = MetricSample {
            timestamp: now - 30 * 86_400,
            source: MetricSource::System,
            metric_name: "cpu_percent".to_string(),
            value: 1.0,
        };
        let nan = MetricSample {
            timestamp: now,
            source: MetricSource::System,
            metric_name: "cpu_percent".to_string(),
            value: f64::NAN,
        };
        let good = MetricSample::now(MetricSource::System, "cpu_percent", 3.0);
        let report = writer.write_metrics(&[future, stale, nan, good]).unwrap();
        assert_eq!(report, IngestReport { inserted: 1, rejected: 3 });
        assert_eq!(count(&writer, "system_metrics"), 1);
    }

    #[test]
    fn log_events_require_source_and_message() {
        let writer = writer();
        let mut no_source = LogEvent::new("", "something happened");
        no_source.source = "  ".to_string();
        let no_message = LogEvent::new("auth", "");
        let good = LogEvent::new("auth", "Accepted publickey for ops from 10.0.0.1");
        let report = writer
            .write_log_events(&[no_source, no_message, good])
            .unwrap();
        assert_eq!(report, IngestReport { inserted: 1, rejected: 2 });
        assert_eq!(count(&writer, "log_events"), 1);
    }

    #[test]
    fn log_event_metadata_stored_as_json() {
        let writer = writer();
        let mut event = LogEvent::new("fail2ban", "[sshd] Ban 1.2.3.4");
        event.action = Some("ban".to_string());
        event.metadata = Some(serde_json::json!({ "jail": "sshd" }));
        writer.write_log_events(&[event]).unwrap();
        let raw: String = writer
            .store
            .with_retry(|conn| {
                Ok(conn.query_row("SELECT metadata FROM log_events", [], |row| row.get(0))?)
            })
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["jail"], "sshd");
    }

    #[test]
    fn unknown_sources_are_rejected_when_restricted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = IngestWriter::new(store, 300, 7)
            .with_known_sources(["auth".to_string(), "syslog".to_string()]);
        let report = writer
            .write_log_events(&[
                LogEvent::new("auth", "known source"),
                LogEvent::new("nginx", "unconfigured source"),
            ])
            .unwrap();
        assert_eq!(report, IngestReport { inserted: 1, rejected: 1 });
        assert!(writer
            .write_log_event(&LogEvent::new("nginx", "still unknown"))
            .is_err());
    }

    #[test]
    fn single_writes_reject_malformed_rows_as_errors() {
        let writer = writer();
        let ok = MetricSample::now(MetricSource::System, "cpu_percent", 1.0);
        writer.write_metric(&ok).unwrap();

        let mut bad = ok.clone();
        bad.value = f64::INFINITY;
        let err = writer.write_metric(&bad).unwrap_err();
        assert!(matches!(err, crate::error::LoglyError::DataIntegrity(_)));

        let empty_msg = LogEvent::new("auth", "");
        assert!(writer.write_log_event(&empty_msg).is_err());
        writer
            .write_log_event(&LogEvent::new("auth", "fine"))
            .unwrap();
    }

    #[test]
    fn traces_route_by_payload() {
        let writer = writer();
        let now = Utc::now().timestamp();
        let traces = [
            TraceRecord {
                trace_id: "t1".to_string(),
                timestamp: now,
                source: "auth".to_string(),
                detail: TraceDetail::Network {
                    ip_address: "1.2.3.4".to_string(),
                    port: Some(22),
                    details: None,
                },
            },
            TraceRecord {
                trace_id: "t1".to_string(),
                timestamp: now,
                source: "syslog".to_string(),
                detail: TraceDetail::Error {
                    level: "ERROR".to_string(),
                    message: "disk failure".to_string(),
                    severity: 60.0,
                },
            },
            TraceRecord {
                trace_id: "t2".to_string(),
                timestamp: now,
                source: "syslog".to_string(),
                detail: TraceDetail::Process {
                    pid: 4242,
                    name: Some("sshd".to_string()),
                    details: None,
                },
            },
        ];
        for trace in &traces {
            writer.write_trace(trace).unwrap();
        }
        assert_eq!(count(&writer, "network_traces"), 1);
        assert_eq!(count(&writer, "error_traces"), 1);
        assert_eq!(count(&writer, "process_traces"), 1);

        let mut bad = traces[0].clone();
        bad.trace_id = String::new();
        assert!(writer.write_trace(&bad).is_err());
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let writer = writer();
        assert_eq!(writer.write_metrics(&[]).unwrap(), IngestReport::default());
        assert_eq!(
            writer.write_log_events(&[]).unwrap(),
            IngestReport::default()
        );
    }
}
