//! Counter store abstraction and the in-memory backend.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::error::AkariError;

/// Errors from a counter backend. The limiter turns all of them into fail-open.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store lock poisoned: {0}")]
    Poisoned(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AkariError {
    fn from(err: StoreError) -> Self {
        AkariError::RateLimitStore(err.to_string())
    }
}

/// Identifies one quota pool: a scope namespace plus an identity inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub scope: String,
    pub identity: String,
}

impl RateLimitKey {
    pub fn new(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identity: identity.into(),
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.identity)
    }
}

/// Persisted counter for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    /// Window length; `None` (or zero) means the expiry cannot be determined
    pub ttl_secs: Option<u64>,
    pub max: u32,
}

impl RateLimitRow {
    /// When the window closes, if that can be determined.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl_secs.filter(|t| *t > 0)?;
        let ttl = i64::try_from(ttl).ok()?;
        self.window_start.checked_add_signed(Duration::seconds(ttl))
    }
}

/// What a read-modify-write decided to do with the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    Keep,
    Put(RateLimitRow),
    Delete,
}

/// Durable keyed counters with an atomic read-modify-write primitive.
///
/// `update` must hold the row exclusively while `apply` runs so two callers
/// can never both observe the same count.
pub trait CounterStore: Send + Sync {
    fn update(
        &self,
        key: &RateLimitKey,
        apply: &mut dyn FnMut(Option<RateLimitRow>) -> RowChange,
    ) -> Result<(), StoreError>;

    /// Read a row without touching it.
    fn get(&self, key: &RateLimitKey) -> Result<Option<RateLimitRow>, StoreError>;

    /// Drop rows whose window closed before `now`. Returns how many went.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Process-local counters; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    rows: Mutex<HashMap<RateLimitKey, RateLimitRow>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row directly.
    pub fn insert_raw(&self, key: RateLimitKey, row: RateLimitRow) -> Result<(), StoreError> {
        self.rows
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?
            .insert(key, row);
        Ok(())
    }
}

impl CounterStore for MemoryCounterStore {
    fn update(
        &self,
        key: &RateLimitKey,
        apply: &mut dyn FnMut(Option<RateLimitRow>) -> RowChange,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(|e| StoreError::Poisoned(e.to_string()))?;
        match apply(rows.get(key).cloned()) {
            RowChange::Keep => {}
            RowChange::Put(row) => {
                rows.insert(key.clone(), row);
            }
            RowChange::Delete => {
                rows.remove(key);
            }
        }
        Ok(())
    }

    fn get(&self, key: &RateLimitKey) -> Result<Option<RateLimitRow>, StoreError> {
        let rows = self.rows.lock().map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(rows.get(key).cloned())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let before = rows.len();
        rows.retain(|_, row| row.expires_at().is_none_or(|expires| expires > now));
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(count: u32, ttl_secs: Option<u64>, window_start: DateTime<Utc>) -> RateLimitRow {
        RateLimitRow {
            count,
            window_start,
            ttl_secs,
            max: 5,
        }
    }

    #[test]
    fn test_expires_at() {
        let start = Utc::now();
        assert_eq!(row(1, Some(60), start).expires_at(), Some(start + Duration::seconds(60)));
        assert_eq!(row(1, None, start).expires_at(), None);
        assert_eq!(row(1, Some(0), start).expires_at(), None);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RateLimitKey::new("twitter", "global").to_string(), "twitter:global");
    }

    #[test]
    fn test_memory_update_put_and_delete() {
        let store = MemoryCounterStore::new();
        let key = RateLimitKey::new("s", "i");
        let now = Utc::now();

        store
            .update(&key, &mut |existing| {
                assert!(existing.is_none());
                RowChange::Put(row(1, Some(60), now))
            })
            .unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().count, 1);

        store.update(&key, &mut |_| RowChange::Delete).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_memory_purge_expired_keeps_ttl_less_rows() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();
        store
            .insert_raw(RateLimitKey::new("s", "old"), row(3, Some(10), now - Duration::seconds(60)))
            .unwrap();
        store
            .insert_raw(RateLimitKey::new("s", "live"), row(3, Some(600), now))
            .unwrap();
        store
            .insert_raw(RateLimitKey::new("s", "odd"), row(3, None, now))
            .unwrap();

        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert!(store.get(&RateLimitKey::new("s", "live")).unwrap().is_some());
        assert!(store.get(&RateLimitKey::new("s", "odd")).unwrap().is_some());
    }
}
