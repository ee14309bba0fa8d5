//! Retry policy for posting.

use std::time::Duration;

use super::{PostError, PostPayload, Poster};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostRetryPolicy {
    /// Total tries, including the first
    pub attempts: u32,
    /// Pause between tries
    pub delay: Duration,
    /// Bound on each try; a timeout counts as overloaded
    pub timeout: Duration,
}

impl Default for PostRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Post `payload`, retrying the same payload only while the poster reports
/// overload. Fatal errors return immediately.
pub async fn post_with_retry(
    poster: &dyn Poster,
    payload: &PostPayload,
    policy: &PostRetryPolicy,
) -> Result<String, PostError> {
    let attempts = policy.attempts.max(1);
    let mut last = PostError::Overloaded("no attempt made".to_string());

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(policy.timeout, poster.post(payload)).await {
            Ok(result) => result,
            Err(_) => Err(PostError::Overloaded(format!("timed out after {:?}", policy.timeout))),
        };

        match result {
            Ok(url) => {
                tracing::info!(poster = poster.name(), attempt, url = %url, "Posted");
                return Ok(url);
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(poster = poster.name(), attempt, attempts, error = %e, "Post overloaded");
                last = e;
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => {
                tracing::error!(poster = poster.name(), attempt, error = %e, "Post failed");
                return Err(e);
            }
        }
    }

    tracing::error!(poster = poster.name(), attempts, error = %last, "Post retries exhausted");
    Err(last)
}
