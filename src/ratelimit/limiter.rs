//! Fixed-window limiter on top of a [`CounterStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::store::{CounterStore, RateLimitKey, RateLimitRow, RowChange};

/// Answer to a single `hit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Hits remaining in the current window after this one.
    pub left: u32,
    /// Seconds until the window resets.
    pub reset_secs: u64,
    /// True when the store could not be consulted and the hit was let through.
    pub backend_unavailable: bool,
}

impl RateLimitResult {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            left: 0,
            reset_secs: 0,
            backend_unavailable: true,
        }
    }
}

/// Decide the outcome of one hit against the current row.
///
/// Pure: the caller is responsible for running this inside the store's
/// exclusive section and applying the returned change.
pub fn decide(
    row: Option<RateLimitRow>,
    max: u32,
    ttl: Duration,
    now: DateTime<Utc>,
) -> (RowChange, RateLimitResult) {
    let ttl_secs = ttl.as_secs();

    let Some(row) = row else {
        return fresh_window(max, ttl_secs, now);
    };

    let Some(expires_at) = row.expires_at() else {
        tracing::warn!(
            count = row.count,
            window_start = %row.window_start,
            "Rate limit row has no expiry, resetting"
        );
        return fresh_window(max, ttl_secs, now);
    };

    if expires_at <= now {
        return fresh_window(max, ttl_secs, now);
    }

    let remaining = expires_at - now;
    // round up so a denied caller never retries a moment too early
    let reset_secs = u64::try_from(remaining.num_milliseconds()).unwrap_or(0).div_ceil(1000);

    if row.count >= max {
        return (
            RowChange::Keep,
            RateLimitResult {
                allowed: false,
                left: 0,
                reset_secs,
                backend_unavailable: false,
            },
        );
    }

    let count = row.count + 1;
    (
        RowChange::Put(RateLimitRow { count, max, ..row }),
        RateLimitResult {
            allowed: true,
            left: max - count,
            reset_secs,
            backend_unavailable: false,
        },
    )
}

fn fresh_window(max: u32, ttl_secs: u64, now: DateTime<Utc>) -> (RowChange, RateLimitResult) {
    if max == 0 {
        return (
            RowChange::Delete,
            RateLimitResult {
                allowed: false,
                left: 0,
                reset_secs: ttl_secs,
                backend_unavailable: false,
            },
        );
    }

    (
        RowChange::Put(RateLimitRow {
            count: 1,
            window_start: now,
            ttl_secs: Some(ttl_secs),
            max,
        }),
        RateLimitResult {
            allowed: true,
            left: max - 1,
            reset_secs: ttl_secs,
            backend_unavailable: false,
        },
    )
}

/// Persistent, concurrency-safe gate keyed by `(scope, identity)`.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    op_timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            op_timeout: Self::DEFAULT_OP_TIMEOUT,
        }
    }

    /// Bound applied by [`RateLimiter::check`] to each store round trip.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Record a hit for `(scope, identity)` and report whether it is allowed.
    pub fn hit(&self, scope: &str, identity: &str, max: u32, ttl: Duration) -> RateLimitResult {
        self.hit_at(scope, identity, max, ttl, Utc::now())
    }

    /// Same as [`RateLimiter::hit`] with an explicit clock.
    pub fn hit_at(
        &self,
        scope: &str,
        identity: &str,
        max: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let key = RateLimitKey::new(scope, identity);
        let mut decision = None;

        let outcome = self.store.update(&key, &mut |row| {
            let (change, result) = decide(row, max, ttl, now);
            decision = Some(result);
            change
        });

        match (outcome, decision) {
            (Ok(()), Some(result)) => {
                if !result.allowed {
                    tracing::info!(
                        scope,
                        identity,
                        max,
                        reset_secs = result.reset_secs,
                        "Rate limit reached"
                    );
                }
                result
            }
            (Ok(()), None) => {
                tracing::warn!(%key, "Rate limit store skipped the update, failing open");
                RateLimitResult::fail_open()
            }
            (Err(e), _) => {
                tracing::warn!(%key, error = %e, "Rate limit store unavailable, failing open");
                RateLimitResult::fail_open()
            }
        }
    }

    /// What a hit would return right now, without counting one. Store
    /// errors fail open like [`RateLimiter::hit`].
    pub fn available_at(
        &self,
        scope: &str,
        identity: &str,
        max: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        match self.store.get(&RateLimitKey::new(scope, identity)) {
            Ok(row) => decide(row, max, ttl, now).1,
            Err(e) => {
                tracing::warn!(scope, identity, error = %e, "Rate limit store unavailable, failing open");
                RateLimitResult::fail_open()
            }
        }
    }

    /// Async hit for callers on the runtime: the store round trip runs on the
    /// blocking pool under `op_timeout`, and a timeout fails open.
    pub async fn check(&self, scope: &str, identity: &str, max: u32, ttl: Duration) -> RateLimitResult {
        let (scope_owned, identity_owned) = (scope.to_string(), identity.to_string());
        self.on_blocking_pool(scope, identity, move |limiter| {
            limiter.hit(&scope_owned, &identity_owned, max, ttl)
        })
        .await
    }

    /// Async [`RateLimiter::available_at`], bounded the same way as `check`.
    pub async fn available(&self, scope: &str, identity: &str, max: u32, ttl: Duration) -> RateLimitResult {
        let (scope_owned, identity_owned) = (scope.to_string(), identity.to_string());
        self.on_blocking_pool(scope, identity, move |limiter| {
            limiter.available_at(&scope_owned, &identity_owned, max, ttl, Utc::now())
        })
        .await
    }

    async fn on_blocking_pool<F>(&self, scope: &str, identity: &str, op: F) -> RateLimitResult
    where
        F: FnOnce(&RateLimiter) -> RateLimitResult + Send + 'static,
    {
        let limiter = self.clone();
        let task = tokio::task::spawn_blocking(move || op(&limiter));

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(scope, identity, error = %e, "Rate limit task failed, failing open");
                RateLimitResult::fail_open()
            }
            Err(_) => {
                tracing::warn!(
                    scope,
                    identity,
                    timeout_ms = self.op_timeout.as_millis() as u64,
                    "Rate limit check timed out, failing open"
                );
                RateLimitResult::fail_open()
            }
        }
    }

    /// Read the row for a key without counting a hit.
    pub fn peek(&self, scope: &str, identity: &str) -> crate::error::Result<Option<RateLimitRow>> {
        Ok(self.store.get(&RateLimitKey::new(scope, identity))?)
    }

    /// Drop closed windows. Errors are logged, not returned.
    pub fn purge_expired(&self) -> usize {
        match self.store.purge_expired(Utc::now()) {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(removed, "Purged expired rate limit rows");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge expired rate limit rows");
                0
            }
        }
    }
}
