//! Logly: a single-host metrics and log intelligence agent.
//!
//! Logly samples system and network metrics, tails and parses log files,
//! and stores everything in one SQLite database. Background engines then
//! correlate log events into traces with per-IP reputation scoring and
//! pattern detection, roll raw samples into hourly and daily aggregates,
//! and bound disk usage with retention sweeps.

pub mod aggregate;
pub mod collect;
pub mod config;
pub mod correlate;
pub mod error;
pub mod retention;
pub mod scheduler;
pub mod store;

pub use config::LoglyConfig;
pub use error::{LoglyError, Result};
pub use store::Store;
