//! Persistent rate limiting.
//!
//! A [`RateLimiter`] counts hits per `(scope, identity)` in fixed windows.
//! Counters live in a [`CounterStore`]: SQLite for durability across
//! restarts and processes, or memory for tests and one-shot runs. When the
//! store cannot be reached the limiter fails open.

mod limiter;
mod sqlite;
mod store;

pub use limiter::{RateLimitResult, RateLimiter, decide};
pub use sqlite::SqliteCounterStore;
pub use store::{CounterStore, MemoryCounterStore, RateLimitKey, RateLimitRow, RowChange, StoreError};

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bound on one store round trip before failing open
    pub op_timeout_ms: u64,
    /// Use an in-memory store instead of the SQLite file
    pub in_memory: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: RateLimiter::DEFAULT_OP_TIMEOUT.as_millis() as u64,
            in_memory: false,
        }
    }
}

impl RateLimitConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}
