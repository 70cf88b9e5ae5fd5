use super::{
    note_sqlite_busy_error, note_sqlite_write_retry, SqliteStore, SQLITE_WRITE_MAX_RETRIES,
    SQLITE_WRITE_RETRY_BACKOFF_MS,
};
use rusqlite::{Connection, ErrorCode};
use std::time::Duration as StdDuration;

impl SqliteStore {
    /// Runs a write, retrying on busy/locked with a fixed backoff schedule.
    pub(crate) fn write_with_retry<T, F>(&self, mut operation: F) -> rusqlite::Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0usize;
        loop {
            let error = match operation(&self.conn) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !is_retryable_sqlite_error(&error) {
                return Err(error);
            }
            note_sqlite_busy_error();
            let Some(backoff_ms) = SQLITE_WRITE_RETRY_BACKOFF_MS.get(attempt).copied() else {
                return Err(error);
            };
            note_sqlite_write_retry();
            tracing::debug!(attempt, backoff_ms, "sqlite busy, retrying write");
            std::thread::sleep(StdDuration::from_millis(backoff_ms));
            attempt += 1;
            debug_assert!(attempt <= SQLITE_WRITE_MAX_RETRIES);
        }
    }
}

fn is_retryable_sqlite_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("database is locked")
        || lowered.contains("database is busy")
        || lowered.contains("database table is locked")
}

pub(crate) fn is_retryable_sqlite_error(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(code, message) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) || message
                .as_deref()
                .is_some_and(is_retryable_sqlite_message)
        }
        _ => is_retryable_sqlite_message(&error.to_string()),
    }
}

pub fn is_retryable_sqlite_anyhow_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(sqlite_error) => is_retryable_sqlite_error(sqlite_error),
        None => is_retryable_sqlite_message(&cause.to_string()),
    })
}
