//! Retention sweeps.
//!
//! Raw rows are deleted only after the engines that read them have moved
//! past: metric rows stay until both rollup watermarks cover them, and log
//! events stay until the correlation watermark for their source does. Trace
//! detail rows age out with the raw data; aggregates, patterns, and
//! reputation on the longer retention clock. Deletes run in bounded
//! batches, each in its own transaction, so a sweep never holds the writer
//! lock for long.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;

use crate::aggregate::Resolution;
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::store::models::MetricSource;
use crate::store::{metadata, Store};

/// Rows deleted per table in one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted: BTreeMap<&'static str, usize>,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: i64,
    keep_raw_data_days: i64,
    batch_size: usize,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, database: &DatabaseConfig, batch_size: usize) -> Self {
        Self {
            store,
            retention_days: database.retention_days,
            keep_raw_data_days: database.keep_raw_data_days,
            batch_size,
        }
    }

    pub fn sweep(&self) -> Result<SweepStats> {
        let now = Utc::now().timestamp();
        let raw_cutoff = now - self.keep_raw_data_days * 86_400;
        let aggregate_cutoff = now - self.retention_days * 86_400;

        let mut stats = SweepStats::default();
        for source in [MetricSource::System, MetricSource::Network] {
            let n = self.sweep_metric_table(source, raw_cutoff)?;
            stats.deleted.insert(source.table(), n);
        }
        stats
            .deleted
            .insert("log_events", self.sweep_log_events(raw_cutoff)?);

        for table in ["event_traces", "process_traces", "network_traces", "error_traces"] {
            let n = self.delete_batched(table, "timestamp < ?1", raw_cutoff)?;
            stats.deleted.insert(table, n);
        }
        for table in ["hourly_aggregates", "daily_aggregates"] {
            let n = self.delete_batched(table, "window_start < ?1", aggregate_cutoff)?;
            stats.deleted.insert(table, n);
        }
        stats.deleted.insert(
            "trace_patterns",
            self.delete_batched("trace_patterns", "last_seen < ?1", aggregate_cutoff)?,
        );
        // Malicious IPs are kept regardless of age.
        stats.deleted.insert(
            "ip_reputation",
            self.delete_batched(
                "ip_reputation",
                "last_seen < ?1 AND is_malicious = 0",
                aggregate_cutoff,
            )?,
        );

        self.store
            .with_retry(|conn| metadata::record_last_run(conn, "retention"))?;
        if stats.total() > 0 {
            tracing::info!(deleted = stats.total(), "retention sweep complete");
        }
        Ok(stats)
    }

    /// Delete raw metric rows past the age cutoff, but never rows the
    /// rollup passes have not folded in yet.
    fn sweep_metric_table(&self, source: MetricSource, cutoff: i64) -> Result<usize> {
        let table = source.table();
        let safe_rowid = self.store.with_retry(|conn| {
            let hourly = metadata::aggregation_watermark(conn, Resolution::Hourly.name(), table)?;
            let daily = metadata::aggregation_watermark(conn, Resolution::Daily.name(), table)?;
            Ok(hourly.min(daily))
        })?;
        let mut total = 0;
        loop {
            let deleted = self.store.with_retry(|conn| {
                delete_batch(
                    conn,
                    table,
                    "timestamp < ?1 AND id <= ?2",
                    rusqlite::params![cutoff, safe_rowid],
                    self.batch_size,
                )
            })?;
            total += deleted;
            if deleted < self.batch_size {
                break;
            }
        }
        if total > 0 {
            tracing::debug!(table, rows = total, "deleted expired metric rows");
        }
        Ok(total)
    }

    /// Delete log events past the age cutoff, clamped per source to the
    /// correlation watermark.
    fn sweep_log_events(&self, cutoff: i64) -> Result<usize> {
        let sources: Vec<String> = self.store.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT source FROM log_events")?;
            let sources = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(sources)
        })?;

        let mut total = 0;
        for source in sources {
            let watermark = self
                .store
                .with_retry(|conn| metadata::correlation_watermark(conn, &source))?;
            loop {
                let deleted = self.store.with_retry(|conn| {
                    delete_batch(
                        conn,
                        "log_events",
                        "source = ?1 AND timestamp < ?2 AND id <= ?3",
                        rusqlite::params![source, cutoff, watermark],
                        self.batch_size,
                    )
                })?;
                total += deleted;
                if deleted < self.batch_size {
                    break;
                }
            }
        }
        if total > 0 {
            tracing::debug!(rows = total, "deleted expired log events");
        }
        Ok(total)
    }

    fn delete_batched(&self, table: &'static str, condition: &str, cutoff: i64) -> Result<usize> {
        let mut total = 0;
        loop {
            let deleted = self.store.with_retry(|conn| {
                delete_batch(conn, table, condition, rusqlite::params![cutoff], self.batch_size)
            })?;
            total += deleted;
            if deleted < self.batch_size {
                break;
            }
        }
        if total > 0 {
            tracing::debug!(table, rows = total, "deleted expired rows");
        }
        Ok(total)
    }
}

fn delete_batch(
    conn: &mut Connection,
    table: &str,
    condition: &str,
    params: impl rusqlite::Params,
    batch_size: usize,
) -> Result<usize> {
    let tx = conn.transaction()?;
    let deleted = tx.execute(
        &format!(
            "DELETE FROM {table} WHERE rowid IN
                (SELECT rowid FROM {table} WHERE {condition} LIMIT {batch_size})"
        ),
        params,
    )?;
    tx.commit()?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationEngine;
    use crate::store::models::MetricSample;

    fn manager(store: Arc<Store>, batch_size: usize) -> RetentionManager {
        let database = DatabaseConfig {
            retention_days: 90,
            keep_raw_data_days: 7,
            ..DatabaseConfig::default()
        };
        RetentionManager::new(store, &database, batch_size)
    }

    fn insert_metric(store: &Arc<Store>, ts: i64, value: f64) {
        store
            .with_retry(|conn| {
                conn.execute(
                    "INSERT INTO system_metrics (timestamp, metric_name, value)
                     VALUES (?1, 'cpu_percent', ?2)",
                    rusqlite::params![ts, value],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn count(store: &Arc<Store>, table: &str) -> i64 {
        store
            .with_retry(|conn| {
                Ok(conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap()
    }

    #[test]
    fn unaggregated_rows_survive_the_sweep() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old = Utc::now().timestamp() - 30 * 86_400;
        insert_metric(&store, old, 1.0);
        let stats = manager(store.clone(), 500).sweep().unwrap();
        assert_eq!(stats.deleted["system_metrics"], 0);
        assert_eq!(count(&store, "system_metrics"), 1);
    }

    #[test]
    fn aggregated_expired_rows_are_deleted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old = Utc::now().timestamp() - 30 * 86_400;
        insert_metric(&store, old, 1.0);
        insert_metric(&store, old + 60, 2.0);

        let engine = AggregationEngine::new(store.clone());
        engine.run(Resolution::Hourly).unwrap();
        engine.run(Resolution::Daily).unwrap();

        let stats = manager(store.clone(), 500).sweep().unwrap();
        assert_eq!(stats.deleted["system_metrics"], 2);
        assert_eq!(count(&store, "system_metrics"), 0);
        // The rollups themselves are younger than 90 days and stay.
        assert_eq!(count(&store, "hourly_aggregates"), 1);
    }

    #[test]
    fn untraced_log_events_survive_the_sweep() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old = Utc::now().timestamp() - 30 * 86_400;
        store
            .with_retry(|conn| {
                conn.execute(
                    "INSERT INTO log_events (timestamp, source, message, level)
                     VALUES (?1, 'auth', 'old line', 'INFO')",
                    [old],
                )?;
                Ok(())
            })
            .unwrap();
        let stats = manager(store.clone(), 500).sweep().unwrap();
        assert_eq!(stats.deleted["log_events"], 0);
        assert_eq!(count(&store, "log_events"), 1);
    }

    #[test]
    fn correlated_expired_log_events_are_deleted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old = Utc::now().timestamp() - 30 * 86_400;
        store
            .with_retry(|conn| {
                conn.execute(
                    "INSERT INTO log_events (timestamp, source, message, level)
                     VALUES (?1, 'auth', 'old line', 'INFO')",
                    [old],
                )?;
                let rowid = conn.last_insert_rowid();
                metadata::set_correlation_watermark(conn, "auth", rowid)?;
                Ok(())
            })
            .unwrap();
        let stats = manager(store.clone(), 500).sweep().unwrap();
        assert_eq!(stats.deleted["log_events"], 1);
        assert_eq!(count(&store, "log_events"), 0);
    }

    #[test]
    fn trace_rows_age_out_with_raw_data() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now().timestamp();
        store
            .with_retry(|conn| {
                conn.execute(
                    "INSERT INTO event_traces (trace_id, event_id, timestamp, source)
                     VALUES ('t', 1, ?1, 'auth')",
                    [now - 30 * 86_400],
                )?;
                conn.execute(
                    "INSERT INTO event_traces (trace_id, event_id, timestamp, source)
                     VALUES ('t', 2, ?1, 'auth')",
                    [now - 3_600],
                )?;
                Ok(())
            })
            .unwrap();
        let stats = manager(store.clone(), 500).sweep().unwrap();
        assert_eq!(stats.deleted["event_traces"], 1);
        assert_eq!(count(&store, "event_traces"), 1);
    }

    #[test]
    fn sweep_runs_in_batches_until_done() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old = Utc::now().timestamp() - 100 * 86_400;
        store
            .with_retry(|conn| {
                for i in 0..25 {
                    conn.execute(
                        "INSERT INTO event_traces (trace_id, event_id, timestamp, source)
                         VALUES ('t', ?1, ?2, 'auth')",
                        rusqlite::params![i, old + i],
                    )?;
                }
                Ok(())
            })
            .unwrap();
        let stats = manager(store.clone(), 10).sweep().unwrap();
        assert_eq!(stats.deleted["event_traces"], 25);
        assert_eq!(count(&store, "event_traces"), 0);
    }

    #[test]
    fn malicious_ips_outlive_retention() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ancient = Utc::now().timestamp() - 365 * 86_400;
        store
            .with_retry(|conn| {
                conn.execute(
                    "INSERT INTO ip_reputation
                        (ip_address, threat_score, first_seen, last_seen, is_malicious)
                     VALUES ('1.2.3.4', 90.0, ?1, ?1, 1)",
                    [ancient],
                )?;
                conn.execute(
                    "INSERT INTO ip_reputation
                        (ip_address, threat_score, first_seen, last_seen, is_malicious)
                     VALUES ('5.6.7.8', 2.0, ?1, ?1, 0)",
                    [ancient],
                )?;
                Ok(())
            })
            .unwrap();
        let stats = manager(store.clone(), 500).sweep().unwrap();
        assert_eq!(stats.deleted["ip_reputation"], 1);
        assert_eq!(count(&store, "ip_reputation"), 1);
    }
}
