//! Per-IP reputation scoring.
//!
//! Scores decay exponentially with time since the IP was last seen, then
//! take an increment for the new event. The score saturates at 100, and an
//! IP at or above [`MALICIOUS_THRESHOLD`] is flagged malicious. The flag is
//! sticky; decay lowers the score but never clears the flag.

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::store::models::IpReputation;

/// Score at which an IP is marked malicious.
pub const MALICIOUS_THRESHOLD: f64 = 70.0;

/// Decay time constant. One week idle divides a score by e.
const DECAY_TAU_SECS: f64 = 604_800.0;

const BAN_INCREMENT: f64 = 20.0;
const FAILED_LOGIN_INCREMENT: f64 = 5.0;
const SIGHTING_INCREMENT: f64 = 2.0;

/// How an observed event affects an IP's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    Ban,
    FailedLogin,
    Sighting,
}

impl ReputationEvent {
    pub fn from_action(action: Option<&str>) -> Self {
        match action {
            Some("ban") => ReputationEvent::Ban,
            Some("failed_login") | Some("unauthorized") => ReputationEvent::FailedLogin,
            _ => ReputationEvent::Sighting,
        }
    }

    fn increment(&self) -> f64 {
        match self {
            ReputationEvent::Ban => BAN_INCREMENT,
            ReputationEvent::FailedLogin => FAILED_LOGIN_INCREMENT,
            ReputationEvent::Sighting => SIGHTING_INCREMENT,
        }
    }
}

/// Decayed score plus the event's increment, capped at 100.
pub fn next_score(current: f64, idle_secs: i64, event: ReputationEvent) -> f64 {
    let idle = idle_secs.max(0) as f64;
    let decayed = current * (-idle / DECAY_TAU_SECS).exp();
    (decayed + event.increment()).min(100.0)
}

/// Fold one event into the IP's reputation row, creating it on first sight.
/// Returns the updated row.
pub fn apply_event(
    conn: &Connection,
    ip_address: &str,
    event: ReputationEvent,
    timestamp: i64,
) -> Result<IpReputation> {
    let existing = load(conn, ip_address)?;
    let was_malicious = existing.as_ref().map(|r| r.is_malicious).unwrap_or(false);
    let updated = match existing {
        Some(mut rep) => {
            let idle = timestamp - rep.last_seen;
            rep.threat_score = next_score(rep.threat_score, idle, event);
            rep.event_count += 1;
            match event {
                ReputationEvent::Ban => rep.ban_count += 1,
                ReputationEvent::FailedLogin => rep.failed_login_count += 1,
                ReputationEvent::Sighting => {}
            }
            rep.last_seen = rep.last_seen.max(timestamp);
            rep.is_malicious = rep.is_malicious || rep.threat_score >= MALICIOUS_THRESHOLD;
            rep
        }
        None => IpReputation {
            ip_address: ip_address.to_string(),
            threat_score: next_score(0.0, 0, event),
            failed_login_count: matches!(event, ReputationEvent::FailedLogin) as i64,
            ban_count: matches!(event, ReputationEvent::Ban) as i64,
            event_count: 1,
            is_malicious: false,
            first_seen: timestamp,
            last_seen: timestamp,
        },
    };

    conn.execute(
        "INSERT INTO ip_reputation
            (ip_address, threat_score, failed_login_count, ban_count, event_count,
             is_malicious, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(ip_address) DO UPDATE SET
            threat_score = excluded.threat_score,
            failed_login_count = excluded.failed_login_count,
            ban_count = excluded.ban_count,
            event_count = excluded.event_count,
            is_malicious = excluded.is_malicious,
            last_seen = excluded.last_seen",
        rusqlite::params![
            updated.ip_address,
            updated.threat_score,
            updated.failed_login_count,
            updated.ban_count,
            updated.event_count,
            updated.is_malicious as i64,
            updated.first_seen,
            updated.last_seen,
        ],
    )?;

    if updated.is_malicious && !was_malicious {
        tracing::warn!(
            ip = %updated.ip_address,
            score = updated.threat_score,
            bans = updated.ban_count,
            failed_logins = updated.failed_login_count,
            "ip crossed malicious threshold"
        );
    }
    Ok(updated)
}

pub fn load(conn: &Connection, ip_address: &str) -> Result<Option<IpReputation>> {
    let row = conn
        .query_row(
            "SELECT ip_address, threat_score, failed_login_count, ban_count, event_count,
                    is_malicious, first_seen, last_seen
             FROM ip_reputation WHERE ip_address = ?1",
            [ip_address],
            |row| {
                Ok(IpReputation {
                    ip_address: row.get(0)?,
                    threat_score: row.get(1)?,
                    failed_login_count: row.get(2)?,
                    ban_count: row.get(3)?,
                    event_count: row.get(4)?,
                    is_malicious: row.get::<_, i64>(5)? != 0,
                    first_seen: row.get(6)?,
                    last_seen: row.get(7)?,
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

    #[test]
    fn score_is_monotone_in_events_at_same_instant() {
        let mut score = 0.0;
        for _ in 0..10 {
            let next = next_score(score, 0, ReputationEvent::FailedLogin);
            assert!(next > score);
            score = next;
        }
    }

    #[test]
    fn score_caps_at_hundred() {
        let mut score = 0.0;
        for _ in 0..20 {
            score = next_score(score, 0, ReputationEvent::Ban);
        }
        assert_eq!(score, 100.0);
    }

    #[test]
    fn idle_time_decays_the_score() {
        let base = next_score(50.0, 0, ReputationEvent::Sighting);
        let decayed = next_score(50.0, 604_800, ReputationEvent::Sighting);
        assert!(decayed < base);
        // One tau of idle divides the prior score by e.
        let expected = 50.0 / std::f64::consts::E + 2.0;
        assert!((decayed - expected).abs() < 1e-9);
    }

    #[test]
    fn bans_count_and_flag_malicious() {
        let conn = open();
        let mut rep = None;
        for _ in 0..4 {
            rep = Some(apply_event(&conn, "1.2.3.4", ReputationEvent::Ban, 1000).unwrap());
        }
        let rep = rep.unwrap();
        assert_eq!(rep.ban_count, 4);
        assert_eq!(rep.event_count, 4);
        assert!(rep.threat_score >= MALICIOUS_THRESHOLD);
        assert!(rep.is_malicious);
    }

    #[test]
    fn malicious_flag_is_sticky_through_decay() {
        let conn = open();
        for _ in 0..4 {
            apply_event(&conn, "5.6.7.8", ReputationEvent::Ban, 1000).unwrap();
        }
        // Years later a lone sighting decays the score to almost nothing.
        let rep = apply_event(
            &conn,
            "5.6.7.8",
            ReputationEvent::Sighting,
            1000 + 10 * 604_800,
        )
        .unwrap();
        assert!(rep.threat_score < MALICIOUS_THRESHOLD);
        assert!(rep.is_malicious);
    }

    #[test]
    fn first_seen_is_preserved_across_updates() {
        let conn = open();
        apply_event(&conn, "9.9.9.9", ReputationEvent::Sighting, 100).unwrap();
        let rep = apply_event(&conn, "9.9.9.9", ReputationEvent::FailedLogin, 500).unwrap();
        assert_eq!(rep.first_seen, 100);
        assert_eq!(rep.last_seen, 500);
        assert_eq!(rep.failed_login_count, 1);
    }
}
