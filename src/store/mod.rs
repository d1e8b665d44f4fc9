//! SQLite storage layer.
//!
//! A single [`Store`] owns the connection behind a mutex. All writers go
//! through [`Store::with_retry`], which retries transient busy/locked
//! errors with a doubling backoff before giving up.

pub mod ingest;
pub mod metadata;
pub mod models;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{LoglyError, Result};

const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(100);

/// Handle to the Logly database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. Parent directories are created as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database with the full schema applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        apply_pragmas(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.with_retry(|conn| schema::ensure_schema(conn))?;
        Ok(store)
    }

    /// Run `f` against the connection, retrying on SQLITE_BUSY/LOCKED with
    /// a doubling backoff (100ms, 200ms, ...). Non-busy errors and closure
    /// results pass through unchanged.
    pub fn with_retry<T>(&self, mut f: impl FnMut(&mut Connection) -> Result<T>) -> Result<T> {
        let mut delay = BUSY_RETRY_BASE;
        for attempt in 1..=BUSY_RETRY_ATTEMPTS {
            let mut guard = self
                .conn
                .lock()
                .map_err(|_| LoglyError::Schema("connection mutex poisoned".to_string()))?;
            match f(&mut guard) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt < BUSY_RETRY_ATTEMPTS => {
                    drop(guard);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "database busy, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(err) if is_busy(&err) => {
                    return Err(LoglyError::Busy {
                        attempts: BUSY_RETRY_ATTEMPTS,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Err(LoglyError::Busy {
            attempts: BUSY_RETRY_ATTEMPTS,
        })
    }
}

fn is_busy(err: &LoglyError) -> bool {
    matches!(
        err,
        LoglyError::Storage(rusqlite::Error::SqliteFailure(e, _))
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = 10000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 60000;",
    )?;
    Ok(())
}
