//! Schema creation and versioned migrations.
//!
//! All DDL is idempotent (`IF NOT EXISTS`), so re-running against an
//! existing database is a no-op. The current version is tracked in the
//! `metadata` table under `schema_version`.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{LoglyError, Result};

/// One schema revision. Migrations apply in order; each runs inside a
/// transaction together with the version bump.
struct Migration {
    version: &'static str,
    ddl: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: "2.0",
    ddl: "
    CREATE TABLE IF NOT EXISTS system_metrics (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   INTEGER NOT NULL,
        metric_name TEXT NOT NULL,
        value       REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_system_metrics_timestamp
        ON system_metrics (timestamp);

    CREATE TABLE IF NOT EXISTS network_metrics (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   INTEGER NOT NULL,
        metric_name TEXT NOT NULL,
        value       REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_network_metrics_timestamp
        ON network_metrics (timestamp);

    CREATE TABLE IF NOT EXISTS log_events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp  INTEGER NOT NULL,
        source     TEXT NOT NULL,
        message    TEXT NOT NULL,
        level      TEXT NOT NULL DEFAULT 'INFO',
        ip_address TEXT,
        user       TEXT,
        service    TEXT,
        action     TEXT,
        metadata   TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_log_events_timestamp
        ON log_events (timestamp);
    CREATE INDEX IF NOT EXISTS idx_log_events_source
        ON log_events (source);

    CREATE TABLE IF NOT EXISTS event_traces (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id   TEXT NOT NULL,
        event_id   INTEGER UNIQUE,
        timestamp  INTEGER NOT NULL,
        source     TEXT NOT NULL,
        action     TEXT,
        severity   REAL NOT NULL DEFAULT 0,
        ip_address TEXT,
        service    TEXT,
        user       TEXT,
        message    TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_event_traces_timestamp
        ON event_traces (timestamp);
    CREATE INDEX IF NOT EXISTS idx_event_traces_trace_id
        ON event_traces (trace_id);

    CREATE TABLE IF NOT EXISTS process_traces (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id  TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        pid       INTEGER,
        name      TEXT,
        details   TEXT
    );

    CREATE TABLE IF NOT EXISTS network_traces (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id   TEXT NOT NULL,
        timestamp  INTEGER NOT NULL,
        ip_address TEXT,
        port       INTEGER,
        details    TEXT
    );

    CREATE TABLE IF NOT EXISTS error_traces (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id   TEXT NOT NULL,
        timestamp  INTEGER NOT NULL,
        source     TEXT NOT NULL,
        level      TEXT NOT NULL,
        message    TEXT,
        severity   REAL NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS ip_reputation (
        ip_address         TEXT PRIMARY KEY,
        threat_score       REAL NOT NULL DEFAULT 0,
        failed_login_count INTEGER NOT NULL DEFAULT 0,
        ban_count          INTEGER NOT NULL DEFAULT 0,
        event_count        INTEGER NOT NULL DEFAULT 0,
        is_malicious       INTEGER NOT NULL DEFAULT 0,
        first_seen         INTEGER NOT NULL,
        last_seen          INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_ip_reputation_threat_score
        ON ip_reputation (threat_score);

    CREATE TABLE IF NOT EXISTS trace_patterns (
        signature        TEXT NOT NULL,
        window_secs      INTEGER NOT NULL,
        occurrence_count INTEGER NOT NULL DEFAULT 0,
        first_seen       INTEGER NOT NULL,
        last_seen        INTEGER NOT NULL,
        PRIMARY KEY (signature, window_secs)
    );

    CREATE TABLE IF NOT EXISTS hourly_aggregates (
        metric_name  TEXT NOT NULL,
        window_start INTEGER NOT NULL,
        sample_count INTEGER NOT NULL,
        min_value    REAL NOT NULL,
        max_value    REAL NOT NULL,
        avg_value    REAL NOT NULL,
        sum_value    REAL NOT NULL,
        PRIMARY KEY (metric_name, window_start)
    );

    CREATE TABLE IF NOT EXISTS daily_aggregates (
        metric_name  TEXT NOT NULL,
        window_start INTEGER NOT NULL,
        sample_count INTEGER NOT NULL,
        min_value    REAL NOT NULL,
        max_value    REAL NOT NULL,
        avg_value    REAL NOT NULL,
        sum_value    REAL NOT NULL,
        PRIMARY KEY (metric_name, window_start)
    );
    ",
}];

/// Latest schema version this build knows about.
pub const SCHEMA_VERSION: &str = "2.0";

/// Create or migrate the schema, and record bootstrap metadata on first run.
pub fn ensure_schema(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;

    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    for migration in MIGRATIONS {
        if let Some(ref current) = current {
            if version_key(current)? >= version_key(migration.version)? {
                continue;
            }
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration.ddl)?;
        set_metadata(&tx, "schema_version", migration.version)?;
        tx.commit()?;
        tracing::info!(version = migration.version, "applied schema migration");
    }

    bootstrap_metadata(conn)?;
    Ok(())
}

/// Write first-run metadata (creation time, hostname) exactly once.
fn bootstrap_metadata(conn: &Connection) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO metadata (key, value, updated_at) VALUES ('created_at', ?1, ?2)",
        rusqlite::params![now, now],
    )?;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    conn.execute(
        "INSERT OR IGNORE INTO metadata (key, value, updated_at) VALUES ('hostname', ?1, ?2)",
        rusqlite::params![host, now],
    )?;
    Ok(())
}

fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Parse "major.minor" into an ordered key.
fn version_key(version: &str) -> Result<(u32, u32)> {
    let mut parts = version.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok()).or(Some(0));
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(LoglyError::Schema(format!(
            "unparseable schema version: {version}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        conn
    }

    #[test]
    fn creates_all_contract_tables() {
        let conn = open();
        let expected = [
            "system_metrics",
            "network_metrics",
            "log_events",
            "event_traces",
            "process_traces",
            "network_traces",
            "error_traces",
            "ip_reputation",
            "trace_patterns",
            "hourly_aggregates",
            "daily_aggregates",
            "metadata",
        ];
        for table in expected {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn creates_expected_indexes() {
        let conn = open();
        let expected = [
            "idx_system_metrics_timestamp",
            "idx_network_metrics_timestamp",
            "idx_log_events_timestamp",
            "idx_log_events_source",
            "idx_event_traces_timestamp",
            "idx_ip_reputation_threat_score",
        ];
        for index in expected {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
                    [index],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing index {index}");
        }
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let mut conn = open();
        ensure_schema(&mut conn).unwrap();
        ensure_schema(&mut conn).unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn bootstrap_metadata_written_once() {
        let mut conn = open();
        let created: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'created_at'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        ensure_schema(&mut conn).unwrap();
        let created_again: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'created_at'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(created, created_again);
        let host: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'hostname'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!host.is_empty());
    }

    #[test]
    fn version_keys_order_numerically() {
        assert!(version_key("2.0").unwrap() > version_key("1.9").unwrap());
        assert!(version_key("10.0").unwrap() > version_key("2.0").unwrap());
        assert!(version_key("bogus").is_err());
    }
}
