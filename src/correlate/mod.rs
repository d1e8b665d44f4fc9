//! Log event correlation.
//!
//! Each cycle drains new `log_events` rows past the per-source rowid
//! watermark, scores them, groups them into traces, updates IP reputation,
//! and records recurring patterns. The watermark tracks rowids rather than
//! timestamps, so a burst of events sharing one second can never be split
//! across the cursor. Event processing and the watermark advance commit in
//! one transaction per source, so a crash replays the batch; replays are
//! absorbed by the unique `event_id` on `event_traces`.

pub mod patterns;
pub mod reputation;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, Transaction};
use uuid::Uuid;

use crate::config::CorrelationConfig;
use crate::error::Result;
use crate::store::models::{LogEvent, StoredLogEvent};
use crate::store::{metadata, Store};

/// Open traces kept in memory before the oldest are force-closed.
const MAX_OPEN_TRACES: usize = 10_000;

/// Counters for one correlation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub events_processed: usize,
    pub events_replayed: usize,
    pub traces_opened: usize,
    pub traces_closed: usize,
    pub reputation_updates: usize,
    pub patterns_recorded: usize,
}

struct OpenTrace {
    trace_id: String,
    last_seen: i64,
}

pub struct CorrelationEngine {
    store: Arc<Store>,
    config: CorrelationConfig,
    /// Trace key -> open trace. Keys are the same strings used for pattern
    /// subjects: IP first, then service, then source.
    open_traces: HashMap<String, OpenTrace>,
}

impl CorrelationEngine {
    pub fn new(store: Arc<Store>, config: CorrelationConfig) -> Self {
        Self {
            store,
            config,
            open_traces: HashMap::new(),
        }
    }

    /// Process all sources with pending events, then close idle traces.
    pub fn run_cycle(&mut self) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let sources = self.store.with_retry(|conn| distinct_sources(conn))?;
        for source in sources {
            self.process_source(&source, &mut stats)?;
        }
        self.close_idle_traces(Utc::now().timestamp(), &mut stats);
        self.store
            .with_retry(|conn| metadata::record_last_run(conn, "correlation"))?;
        if stats.events_processed > 0 || stats.traces_closed > 0 {
            tracing::info!(
                events = stats.events_processed,
                replayed = stats.events_replayed,
                traces_opened = stats.traces_opened,
                traces_closed = stats.traces_closed,
                patterns = stats.patterns_recorded,
                "correlation cycle complete"
            );
        }
        Ok(stats)
    }

    fn process_source(&mut self, source: &str, stats: &mut CycleStats) -> Result<()> {
        let batch_size = self.config.batch_size;
        loop {
            let watermark = self
                .store
                .with_retry(|conn| metadata::correlation_watermark(conn, source))?;
            let batch = self
                .store
                .with_retry(|conn| fetch_batch(conn, source, watermark, batch_size))?;
            if batch.is_empty() {
                return Ok(());
            }

            let full = batch.len() == batch_size;
            let new_watermark = batch[batch.len() - 1].id;

            // Collect trace assignments outside the storage closure; the
            // open-trace map is engine state, not database state.
            let assignments: Vec<(StoredLogEvent, String)> = batch
                .into_iter()
                .map(|row| {
                    let trace_id = self.assign_trace(&row.event, stats);
                    (row, trace_id)
                })
                .collect();

            let batch_stats = self.store.with_retry(|conn| {
                let tx = conn.transaction()?;
                let mut batch_stats = CycleStats::default();
                for (row, trace_id) in &assignments {
                    process_event(&tx, row, trace_id, &self.config, &mut batch_stats)?;
                }
                metadata::set_correlation_watermark(&tx, source, new_watermark)?;
                tx.commit()?;
                Ok(batch_stats)
            })?;
            stats.events_processed += batch_stats.events_processed;
            stats.events_replayed += batch_stats.events_replayed;
            stats.reputation_updates += batch_stats.reputation_updates;
            stats.patterns_recorded += batch_stats.patterns_recorded;

            if !full {
                return Ok(());
            }
        }
    }

    /// Find or open the trace this event belongs to.
    fn assign_trace(&mut self, event: &LogEvent, stats: &mut CycleStats) -> String {
        let key = trace_key(event);
        let window = self.config.window_secs;
        if let Some(open) = self.open_traces.get_mut(&key) {
            if (event.timestamp - open.last_seen).abs() <= window {
                open.last_seen = open.last_seen.max(event.timestamp);
                return open.trace_id.clone();
            }
        }
        let trace_id = Uuid::new_v4().to_string();
        let stale = self.open_traces.insert(
            key,
            OpenTrace {
                trace_id: trace_id.clone(),
                last_seen: event.timestamp,
            },
        );
        if stale.is_some() {
            // The previous trace for this key fell outside the window.
            stats.traces_closed += 1;
        }
        stats.traces_opened += 1;
        if self.open_traces.len() > MAX_OPEN_TRACES {
            self.evict_oldest(stats);
        }
        trace_id
    }

    fn close_idle_traces(&mut self, now: i64, stats: &mut CycleStats) {
        let idle = self.config.idle_close_secs;
        let before = self.open_traces.len();
        self.open_traces.retain(|_, open| now - open.last_seen <= idle);
        stats.traces_closed += before - self.open_traces.len();
    }

    fn evict_oldest(&mut self, stats: &mut CycleStats) {
        if let Some(key) = self
            .open_traces
            .iter()
            .min_by_key(|(_, open)| open.last_seen)
            .map(|(key, _)| key.clone())
        {
            self.open_traces.remove(&key);
            stats.traces_closed += 1;
        }
    }

    #[cfg(test)]
    fn open_trace_count(&self) -> usize {
        self.open_traces.len()
    }
}

/// Severity on a 0..=100 scale, from the syslog level plus a bump for
/// security-relevant actions.
pub fn severity(event: &LogEvent) -> f64 {
    let base: f64 = match event.level.as_str() {
        "DEBUG" => 0.0,
        "INFO" => 10.0,
        "WARNING" => 30.0,
        "ERROR" => 60.0,
        "CRITICAL" => 90.0,
        _ => 10.0,
    };
    let bump = match event.action.as_deref() {
        Some("ban") | Some("failed_login") | Some("unauthorized") => 20.0,
        _ => 0.0,
    };
    (base + bump).min(100.0)
}

fn trace_key(event: &LogEvent) -> String {
    if let Some(ip) = &event.ip_address {
        return format!("ip:{ip}");
    }
    if let Some(service) = &event.service {
        return format!("service:{service}");
    }
    format!("source:{}", event.source)
}

fn process_event(
    tx: &Transaction<'_>,
    row: &StoredLogEvent,
    trace_id: &str,
    config: &CorrelationConfig,
    stats: &mut CycleStats,
) -> Result<()> {
    let event = &row.event;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO event_traces
            (trace_id, event_id, timestamp, source, action, severity,
             ip_address, service, user, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            trace_id,
            row.id,
            event.timestamp,
            event.source,
            event.action,
            severity(event),
            event.ip_address,
            event.service,
            event.user,
            event.message,
        ],
    )?;
    if inserted == 0 {
        // Already traced in a previous run of this batch.
        stats.events_replayed += 1;
        return Ok(());
    }
    stats.events_processed += 1;

    route_detail_trace(tx, row, trace_id)?;

    if let Some(ip) = &event.ip_address {
        let reputation_event = reputation::ReputationEvent::from_action(event.action.as_deref());
        reputation::apply_event(tx, ip, reputation_event, event.timestamp)?;
        stats.reputation_updates += 1;
    }
    if patterns::record_occurrence(
        tx,
        event,
        config.pattern_window_secs,
        config.pattern_threshold,
    )?
    .is_some()
    {
        stats.patterns_recorded += 1;
    }
    Ok(())
}

/// Copy the event into the detail table matching its shape.
fn route_detail_trace(tx: &Transaction<'_>, row: &StoredLogEvent, trace_id: &str) -> Result<()> {
    let event = &row.event;
    if matches!(event.level.as_str(), "ERROR" | "CRITICAL") {
        tx.execute(
            "INSERT INTO error_traces (trace_id, timestamp, source, level, message, severity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                trace_id,
                event.timestamp,
                event.source,
                event.level,
                event.message,
                severity(event),
            ],
        )?;
    }
    if let Some(ip) = &event.ip_address {
        let port = event
            .metadata
            .as_ref()
            .and_then(|m| m.get("port"))
            .and_then(|p| p.as_i64());
        tx.execute(
            "INSERT INTO network_traces (trace_id, timestamp, ip_address, port, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![trace_id, event.timestamp, ip, port, event.message],
        )?;
    }
    if let Some(pid) = event
        .metadata
        .as_ref()
        .and_then(|m| m.get("pid"))
        .and_then(|p| p.as_i64())
    {
        tx.execute(
            "INSERT INTO process_traces (trace_id, timestamp, pid, name, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                trace_id,
                event.timestamp,
                pid,
                event.service,
                event.message
            ],
        )?;
    }
    Ok(())
}

fn distinct_sources(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT source FROM log_events ORDER BY source")?;
    let sources = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(sources)
}

fn fetch_batch(
    conn: &Connection,
    source: &str,
    watermark: i64,
    batch_size: usize,
) -> Result<Vec<StoredLogEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, source, message, level, ip_address, user, service, action, metadata
         FROM log_events
         WHERE source = ?1 AND id > ?2
         ORDER BY id
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![source, watermark, batch_size as i64],
            |row| {
                let metadata: Option<String> = row.get(9)?;
                Ok(StoredLogEvent {
                    id: row.get(0)?,
                    event: LogEvent {
                        timestamp: row.get(1)?,
                        source: row.get(2)?,
                        message: row.get(3)?,
                        level: row.get(4)?,
                        ip_address: row.get(5)?,
                        user: row.get(6)?,
                        service: row.get(7)?,
                        action: row.get(8)?,
                        metadata: metadata
                            .as_deref()
                            .and_then(|raw| serde_json::from_str(raw).ok()),
                    },
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
