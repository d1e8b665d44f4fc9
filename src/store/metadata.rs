//! Key-value metadata access, including engine watermarks.
//!
//! Watermarks are stored alongside the data they guard so a crash between
//! processing and checkpointing replays work instead of losing it.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{LoglyError, Result};

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn get_i64(conn: &Connection, key: &str) -> Result<Option<i64>> {
    match get(conn, key)? {
        Some(raw) => {
            let value = raw.parse::<i64>().map_err(|_| {
                LoglyError::DataIntegrity(format!("metadata key {key} holds non-integer: {raw}"))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Highest `log_events` rowid the correlation engine has processed for
/// `source`.
pub fn correlation_watermark(conn: &Connection, source: &str) -> Result<i64> {
    Ok(get_i64(conn, &format!("correlation_watermark:{source}"))?.unwrap_or(0))
}

pub fn set_correlation_watermark(conn: &Connection, source: &str, rowid: i64) -> Result<()> {
    set(
        conn,
        &format!("correlation_watermark:{source}"),
        &rowid.to_string(),
    )
}

/// Highest rowid of `table` already folded into `resolution` aggregates.
pub fn aggregation_watermark(conn: &Connection, resolution: &str, table: &str) -> Result<i64> {
    Ok(get_i64(conn, &format!("aggregation_watermark:{resolution}:{table}"))?.unwrap_or(0))
}

pub fn set_aggregation_watermark(
    conn: &Connection,
    resolution: &str,
    table: &str,
    rowid: i64,
) -> Result<()> {
    set(
        conn,
        &format!("aggregation_watermark:{resolution}:{table}"),
        &rowid.to_string(),
    )
}

/// Record when a background task last completed.
pub fn record_last_run(conn: &Connection, task: &str) -> Result<()> {
    set(conn, &format!("last_run:{task}"), &Utc::now().to_rfc3339())
}
