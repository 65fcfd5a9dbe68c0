pub mod lifecycle;
pub mod migrations;
pub mod models;
pub mod threads;
pub mod users;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use waggle_types::{ChatError, ChatResult};

/// SQLite-backed durable store for threads and their message history.
///
/// The connection mutex serializes all writes, which is what gives
/// per-thread appends their arrival-order guarantee: the `seq` column
/// is assigned inside the insert transaction while the lock is held.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> ChatResult<Self> {
        let conn = Connection::open(path).map_err(ChatError::store)?;

        // WAL mode for concurrent reads; busy_timeout is the one-retry
        // policy for transient lock contention.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(ChatError::store)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(ChatError::store)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(ChatError::store)?;

        migrations::run(&conn)?;

        info!("database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory().map_err(ChatError::store)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(ChatError::store)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Connection) -> ChatResult<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ChatError::store(format!("db lock poisoned: {e}")))?;
        f(&conn)
    }
}

/// Maps rusqlite failures onto the shared taxonomy. Unique-constraint
/// collisions become `Conflict` so callers can re-fetch and retry.
pub(crate) fn db_err(e: rusqlite::Error) -> ChatError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ChatError::Conflict
        }
        _ => ChatError::store(e),
    }
}

/// Extension trait turning "no rows" into `None` instead of an error.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> ChatResult<Option<T>>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> ChatResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }
}
