//! SQLite-backed counter store.
//!
//! Counters live in a single `rate_limits` table keyed by (scope, identity).
//! Each hit runs inside an IMMEDIATE transaction, which takes the write lock
//! up front, so concurrent hits from this or another process serialize.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::store::{CounterStore, RateLimitKey, RateLimitRow, RowChange, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteCounterStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCounterStore").finish_non_exhaustive()
    }
}

impl SqliteCounterStore {
    /// Open or create the counter database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                scope TEXT NOT NULL,
                identity TEXT NOT NULL,
                count INTEGER NOT NULL,
                window_start_ms INTEGER NOT NULL,
                ttl_secs INTEGER,
                max INTEGER NOT NULL,
                PRIMARY KEY (scope, identity)
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn read_row(conn: &Connection, key: &RateLimitKey) -> Result<Option<RateLimitRow>, StoreError> {
        let raw = conn
            .query_row(
                "SELECT count, window_start_ms, ttl_secs, max FROM rate_limits WHERE scope = ?1 AND identity = ?2",
                params![key.scope, key.identity],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(raw.map(|(count, window_start_ms, ttl_secs, max)| RateLimitRow {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            // an unreadable timestamp is treated like a missing ttl: the row gets reset
            window_start: DateTime::from_timestamp_millis(window_start_ms).unwrap_or(DateTime::UNIX_EPOCH),
            ttl_secs: ttl_secs.and_then(|t| u64::try_from(t).ok()),
            max: u32::try_from(max).unwrap_or(u32::MAX),
        }))
    }

    fn write_row(conn: &Connection, key: &RateLimitKey, row: &RateLimitRow) -> Result<(), StoreError> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO rate_limits (scope, identity, count, window_start_ms, ttl_secs, max)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                key.scope,
                key.identity,
                row.count,
                row.window_start.timestamp_millis(),
                row.ttl_secs.map(|t| t as i64),
                row.max,
            ],
        )?;
        Ok(())
    }
}

impl CounterStore for SqliteCounterStore {
    fn update(
        &self,
        key: &RateLimitKey,
        apply: &mut dyn FnMut(Option<RateLimitRow>) -> RowChange,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = Self::read_row(&tx, key)?;
        match apply(existing) {
            RowChange::Keep => {}
            RowChange::Put(row) => Self::write_row(&tx, key, &row)?,
            RowChange::Delete => {
                tx.execute(
                    "DELETE FROM rate_limits WHERE scope = ?1 AND identity = ?2",
                    params![key.scope, key.identity],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get(&self, key: &RateLimitKey) -> Result<Option<RateLimitRow>, StoreError> {
        let conn = self.lock()?;
        Self::read_row(&conn, key)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM rate_limits WHERE ttl_secs > 0 AND window_start_ms + ttl_secs * 1000 <= ?1",
            [now.timestamp_millis()],
        )?;
        Ok(removed)
    }
}
