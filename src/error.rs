//! Error types for the Logly storage and engine stack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoglyError {
    /// The embedded DDL could not be applied. Fatal: the storage file must
    /// not be used after this.
    #[error("schema error: {0}")]
    Schema(String),

    /// Underlying SQLite failure (disk full, permissions, corrupt file).
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The database stayed locked past the retry budget. The current cycle
    /// is skipped; the task resumes on its next scheduled tick.
    #[error("database busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// A malformed row was presented for ingestion. The row is skipped and
    /// the batch continues.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    /// A log line could not be turned into a structured event.
    #[error("correlation error: {0}")]
    Correlation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LoglyError>;

impl LoglyError {
    /// Recoverable errors abort only the offending row or cycle; the
    /// service keeps running. Schema and storage failures are fatal for
    /// the affected write path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LoglyError::Busy { .. } | LoglyError::DataIntegrity(_) | LoglyError::Correlation(_)
        )
    }
}
