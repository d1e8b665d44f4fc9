//! Log line parsing.
//!
//! Each configured source gets a parser keyed on its name: fail2ban and
//! auth lines are matched against known patterns, everything else falls
//! through to generic syslog handling. Lines that match nothing still
//! become events; the correlation engine decides what matters.

use std::sync::LazyLock;

use regex::Regex;

use crate::store::models::LogEvent;

static FAIL2BAN_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(?P<jail>[\w-]+)\]\s+(?P<action>Ban|Unban)\s+(?P<ip>[\d.]+)")
        .expect("fail2ban action pattern is valid")
});

static FAIL2BAN_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(?P<jail>[\w-]+)\]\s+Found\s+(?P<ip>[\d.]+)")
        .expect("fail2ban found pattern is valid")
});

static AUTH_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Failed password for (?:invalid user )?(?P<user>\S+) from (?P<ip>[\d.]+)")
        .expect("auth failed pattern is valid")
});

static AUTH_ACCEPTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Accepted (?P<method>\w+) for (?P<user>\S+) from (?P<ip>[\d.]+)")
        .expect("auth accepted pattern is valid")
});

// "Mon DD HH:MM:SS host service[pid]:" prefix on classic syslog lines.
static SYSLOG_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\w{3}\s+\d{1,2}\s+[\d:]{8}\s+\S+\s+(?P<service>[\w./-]+?)(?:\[(?P<pid>\d+)\])?:",
    )
    .expect("syslog prefix pattern is valid")
});

/// Parse one line from the named source into an event stamped `now`.
/// Blank lines yield nothing.
pub fn parse_line(source: &str, line: &str, now: i64) -> Option<LogEvent> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }
    let mut event = LogEvent::new(source, line);
    event.timestamp = now;
    match source {
        "fail2ban" => parse_fail2ban(&mut event, line),
        "auth" => parse_auth(&mut event, line),
        _ => parse_syslog(&mut event, line),
    }
    Some(event)
}

fn parse_fail2ban(event: &mut LogEvent, line: &str) {
    if let Some(caps) = FAIL2BAN_ACTION.captures(line) {
        let jail = &caps["jail"];
        event.ip_address = Some(caps["ip"].to_string());
        event.service = Some(jail.to_string());
        event.metadata = Some(serde_json::json!({ "jail": jail }));
        if &caps["action"] == "Ban" {
            event.action = Some("ban".to_string());
            event.level = "WARNING".to_string();
        } else {
            event.action = Some("unban".to_string());
        }
    } else if let Some(caps) = FAIL2BAN_FOUND.captures(line) {
        event.ip_address = Some(caps["ip"].to_string());
        event.service = Some(caps["jail"].to_string());
        event.action = Some("found".to_string());
        event.metadata = Some(serde_json::json!({ "jail": &caps["jail"] }));
    }
}

fn parse_auth(event: &mut LogEvent, line: &str) {
    parse_syslog(event, line);
    if let Some(caps) = AUTH_FAILED.captures(line) {
        event.ip_address = Some(caps["ip"].to_string());
        event.user = Some(caps["user"].to_string());
        event.action = Some("failed_login".to_string());
        event.level = "WARNING".to_string();
    } else if let Some(caps) = AUTH_ACCEPTED.captures(line) {
        event.ip_address = Some(caps["ip"].to_string());
        event.user = Some(caps["user"].to_string());
        event.action = Some("accepted_login".to_string());
        event.metadata = Some(serde_json::json!({ "method": &caps["method"] }));
    }
}

fn parse_syslog(event: &mut LogEvent, line: &str) {
    if let Some(caps) = SYSLOG_PREFIX.captures(line) {
        event.service = Some(caps["service"].to_string());
        if let Some(pid) = caps.name("pid").and_then(|m| m.as_str().parse::<i64>().ok()) {
            let mut metadata = event
                .metadata
                .take()
                .unwrap_or_else(|| serde_json::json!({}));
            metadata["pid"] = serde_json::json!(pid);
            event.metadata = Some(metadata);
        }
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("critical") || lower.contains("panic") {
        event.level = "CRITICAL".to_string();
    } else if lower.contains("error") {
        event.level = "ERROR".to_string();
    } else if lower.contains("warn") || lower.contains("failed") {
        event.level = "WARNING".to_string();
    }
}
