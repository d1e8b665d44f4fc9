//! Hourly and daily metric rollups.
//!
//! Rollups are driven by a rowid watermark per (resolution, raw table), so
//! any newly inserted row, late-arriving or not, marks its window dirty.
//! Dirty windows are recomputed in full from the raw rows and the result
//! replaces the aggregate row, which makes the whole pass idempotent.

use std::sync::Arc;

use rusqlite::Transaction;

use crate::error::Result;
use crate::store::models::MetricSource;
use crate::store::{metadata, Store};

/// Rollup granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Hourly,
    Daily,
}

impl Resolution {
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::Hourly => 3_600,
            Resolution::Daily => 86_400,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Resolution::Hourly => "hourly_aggregates",
            Resolution::Daily => "daily_aggregates",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resolution::Hourly => "hourly",
            Resolution::Daily => "daily",
        }
    }

    /// Start of the window containing `timestamp`.
    pub fn window_start(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.seconds())
    }
}

/// Counters for one rollup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupStats {
    pub windows_updated: usize,
}

pub struct AggregationEngine {
    store: Arc<Store>,
}

impl AggregationEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Roll both raw metric tables up at the given resolution.
    pub fn run(&self, resolution: Resolution) -> Result<RollupStats> {
        let mut stats = RollupStats::default();
        for source in [MetricSource::System, MetricSource::Network] {
            stats.windows_updated += self.roll_table(resolution, source)?;
        }
        self.store.with_retry(|conn| {
            metadata::record_last_run(conn, &format!("aggregation:{}", resolution.name()))
        })?;
        if stats.windows_updated > 0 {
            tracing::info!(
                resolution = resolution.name(),
                windows = stats.windows_updated,
                "rollup pass complete"
            );
        }
        Ok(stats)
    }

    fn roll_table(&self, resolution: Resolution, source: MetricSource) -> Result<usize> {
        let raw_table = source.table();
        self.store.with_retry(|conn| {
            let tx = conn.transaction()?;
            let watermark = metadata::aggregation_watermark(&tx, resolution.name(), raw_table)?;

            // Windows touched by rows past the watermark, plus the highest
            // rowid so the watermark can advance with the same commit.
            let (dirty, max_rowid) = dirty_windows(&tx, raw_table, resolution, watermark)?;
            if dirty.is_empty() {
                tx.commit()?;
                return Ok(0);
            }

            for (metric_name, window_start) in &dirty {
                recompute_window(&tx, raw_table, resolution, metric_name, *window_start)?;
            }
            metadata::set_aggregation_watermark(&tx, resolution.name(), raw_table, max_rowid)?;
            tx.commit()?;
            Ok(dirty.len())
        })
    }
}

fn dirty_windows(
    tx: &Transaction<'_>,
    raw_table: &str,
    resolution: Resolution,
    watermark: i64,
) -> Result<(Vec<(String, i64)>, i64)> {
    let max_rowid: i64 = tx.query_row(
        &format!("SELECT coalesce(max(id), ?1) FROM {raw_table}"),
        [watermark],
        |row| row.get(0),
    )?;
    let mut stmt = tx.prepare(&format!(
        "SELECT DISTINCT metric_name, timestamp - (timestamp % ?1)
         FROM {raw_table} WHERE id > ?2"
    ))?;
    let dirty = stmt
        .query_map(rusqlite::params![resolution.seconds(), watermark], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((dirty, max_rowid))
}

/// Recompute one (metric, window) from raw rows and replace its aggregate.
fn recompute_window(
    tx: &Transaction<'_>,
    raw_table: &str,
    resolution: Resolution,
    metric_name: &str,
    window_start: i64,
) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO {agg} (metric_name, window_start, sample_count,
                                min_value, max_value, avg_value, sum_value)
             SELECT ?1, ?2, count(*), min(value), max(value), avg(value), sum(value)
             FROM {raw_table}
             WHERE metric_name = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ON CONFLICT(metric_name, window_start) DO UPDATE SET
                sample_count = excluded.sample_count,
                min_value = excluded.min_value,
                max_value = excluded.max_value,
                avg_value = excluded.avg_value,
                sum_value = excluded.sum_value",
            agg = resolution.table(),
        ),
        rusqlite::params![
            metric_name,
            window_start,
            window_start + resolution.seconds()
        ],
    )?;
    Ok(())
}
