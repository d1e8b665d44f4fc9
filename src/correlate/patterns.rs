//! Sliding-window detection of recurring event patterns.
//!
//! The occurrence count for a signature is computed from the traced events
//! inside the window, so it survives restarts and replays for free. A
//! `trace_patterns` row exists only once the count crosses the threshold;
//! further occurrences update that row, they never duplicate it.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::store::models::{LogEvent, TracePattern};

/// Signature for a log event, or `None` if the event carries no action and
/// therefore cannot form a pattern.
pub fn signature(event: &LogEvent) -> Option<String> {
    let action = event.action.as_deref()?;
    Some(format!("{action}:{}", subject(event)))
}

fn subject(event: &LogEvent) -> &str {
    event
        .ip_address
        .as_deref()
        .or(event.service.as_deref())
        .unwrap_or(&event.source)
}

/// Evaluate the event against its signature's sliding window. The event
/// must already be present in `event_traces`. Returns the upserted pattern
/// row once the window count has reached `threshold`, `None` below it or
/// when the event has no signature.
pub fn record_occurrence(
    conn: &Connection,
    event: &LogEvent,
    window_secs: i64,
    threshold: i64,
) -> Result<Option<TracePattern>> {
    let Some(signature) = signature(event) else {
        return Ok(None);
    };

    let (count, window_first) = window_count(conn, event, window_secs)?;
    if count < threshold {
        return Ok(None);
    }

    let existing = load(conn, &signature, window_secs)?;
    let first_seen = match &existing {
        // Still the same streak: keep its origin.
        Some(prev) if event.timestamp - prev.last_seen <= window_secs => prev.first_seen,
        _ => window_first,
    };
    let updated = TracePattern {
        signature: signature.clone(),
        window_secs,
        occurrence_count: count,
        first_seen,
        last_seen: event.timestamp,
    };

    conn.execute(
        "INSERT INTO trace_patterns
            (signature, window_secs, occurrence_count, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(signature, window_secs) DO UPDATE SET
            occurrence_count = excluded.occurrence_count,
            first_seen = excluded.first_seen,
            last_seen = excluded.last_seen",
        rusqlite::params![
            updated.signature,
            updated.window_secs,
            updated.occurrence_count,
            updated.first_seen,
            updated.last_seen,
        ],
    )?;

    if existing.is_none() {
        tracing::warn!(
            signature = %updated.signature,
            count = updated.occurrence_count,
            window_secs,
            "recurring pattern detected"
        );
    }
    Ok(Some(updated))
}

/// Count traced events matching the signature inside the window ending at
/// the event, along with the earliest matching timestamp.
fn window_count(
    conn: &Connection,
    event: &LogEvent,
    window_secs: i64,
) -> Result<(i64, i64)> {
    let subject = subject(event);
    let row = conn.query_row(
        "SELECT count(*), coalesce(min(timestamp), ?4)
         FROM event_traces
         WHERE action = ?1
           AND coalesce(ip_address, service, source) = ?2
           AND timestamp > ?3 AND timestamp <= ?4",
        rusqlite::params![
            event.action,
            subject,
            event.timestamp - window_secs,
            event.timestamp
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(row)
}

pub fn load(conn: &Connection, signature: &str, window_secs: i64) -> Result<Option<TracePattern>> {
    let row = conn
        .query_row(
            "SELECT signature, window_secs, occurrence_count, first_seen, last_seen
             FROM trace_patterns WHERE signature = ?1 AND window_secs = ?2",
            rusqlite::params![signature, window_secs],
            |row| {
                Ok(TracePattern {
                    signature: row.get(0)?,
                    window_secs: row.get(1)?,
                    occurrence_count: row.get(2)?,
                    first_seen: row.get(3)?,
                    last_seen: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ensure_schema;

    fn open() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        conn
    }

    fn failed_login(ts: i64) -> LogEvent {
        let mut event = LogEvent::new("auth", "Failed password for root from 1.2.3.4");
        event.timestamp = ts;
        event.ip_address = Some("1.2.3.4".to_string());
        event.service = Some("sshd".to_string());
        event.action = Some("failed_login".to_string());
        event
    }

    fn trace(conn: &Connection, event: &LogEvent) {
        conn.execute(
            "INSERT INTO event_traces
                (trace_id, timestamp, source, action, severity, ip_address, service, message)
             VALUES ('t', ?1, ?2, ?3, 50.0, ?4, ?5, ?6)",
            rusqlite::params![
                event.timestamp,
                event.source,
                event.action,
                event.ip_address,
                event.service,
                event.message
            ],
        )
        .unwrap();
    }

    fn occurrence(
        conn: &Connection,
        event: &LogEvent,
        threshold: i64,
    ) -> Option<TracePattern> {
        trace(conn, event);
        record_occurrence(conn, event, 300, threshold).unwrap()
    }

    #[test]
    fn no_row_below_threshold() {
        let conn = open();
        assert!(occurrence(&conn, &failed_login(1000), 3).is_none());
        assert!(occurrence(&conn, &failed_login(1010), 3).is_none());
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM trace_patterns", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn crossing_the_threshold_creates_exactly_one_row() {
        let conn = open();
        occurrence(&conn, &failed_login(1000), 3);
        occurrence(&conn, &failed_login(1010), 3);
        let pattern = occurrence(&conn, &failed_login(1020), 3).unwrap();
        assert_eq!(pattern.occurrence_count, 3);
        assert_eq!(pattern.first_seen, 1000);
        assert_eq!(pattern.last_seen, 1020);

        // A fourth occurrence updates the row, it does not duplicate it.
        let pattern = occurrence(&conn, &failed_login(1030), 3).unwrap();
        assert_eq!(pattern.occurrence_count, 4);
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM trace_patterns", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn occurrences_outside_the_window_do_not_count() {
        let conn = open();
        occurrence(&conn, &failed_login(100), 3);
        occurrence(&conn, &failed_login(1000), 3);
        occurrence(&conn, &failed_login(1010), 3);
        // Only two of the three fall in the 300s window ending at 1010.
        assert!(load(&conn, "failed_login:1.2.3.4", 300).unwrap().is_none());
        let pattern = occurrence(&conn, &failed_login(1020), 3).unwrap();
        assert_eq!(pattern.occurrence_count, 3);
    }

    #[test]
    fn ip_takes_precedence_over_service_in_signature() {
        let event = failed_login(1000);
        assert_eq!(signature(&event).unwrap(), "failed_login:1.2.3.4");

        let mut no_ip = event.clone();
        no_ip.ip_address = None;
        assert_eq!(signature(&no_ip).unwrap(), "failed_login:sshd");

        let mut bare = no_ip.clone();
        bare.service = None;
        assert_eq!(signature(&bare).unwrap(), "failed_login:auth");
    }

    #[test]
    fn actionless_events_form_no_pattern() {
        let conn = open();
        let event = LogEvent::new("syslog", "kernel: eth0 link up");
        assert!(record_occurrence(&conn, &event, 300, 3).unwrap().is_none());
    }
}
