//! Bounded retry around a [`Composer`].
//!
//! Each attempt's outcome decides the next step:
//! - `Success`: done
//! - `TooLarge`: that source is excluded and the next attempt searches again;
//!   with a fixed source hint there is nothing else to try, so give up
//! - `TransientToolFailure` (or an attempt timeout): try again as-is
//! - `NoSourceAvailable`: give up on this text immediately

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::{ComposeConfig, Composer};
use crate::domain::{Artifact, ComposeAttemptResult, ComposeRequest};
use crate::shutdown::Shutdown;

/// Why no artifact was produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeFailure {
    #[error("No usable source image")]
    NoSourceAvailable,

    #[error("Compose attempts exhausted after {attempts} tries")]
    Exhausted { attempts: u32 },

    #[error("Compose cancelled by shutdown")]
    Cancelled,
}

/// A successful compose and how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composed {
    pub artifact: Artifact,
    pub attempts: u32,
}

pub struct ComposeRetryController {
    composer: Arc<dyn Composer>,
    max_attempts: u32,
    attempt_timeout: Duration,
}

impl ComposeRetryController {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(composer: Arc<dyn Composer>) -> Self {
        Self {
            composer,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: Self::DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn from_config(composer: Arc<dyn Composer>, config: &ComposeConfig) -> Self {
        Self::new(composer)
            .with_max_attempts(config.max_attempts)
            .with_attempt_timeout(config.attempt_timeout())
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Compose `text` using the configured attempt budget.
    pub async fn try_compose(
        &self,
        text: &str,
        source_hint: Option<&str>,
        shutdown: &Shutdown,
    ) -> Result<Composed, ComposeFailure> {
        self.try_compose_with(text, source_hint, self.max_attempts, shutdown).await
    }

    /// Compose `text` with at most `max_attempts` attempts.
    pub async fn try_compose_with(
        &self,
        text: &str,
        source_hint: Option<&str>,
        max_attempts: u32,
        shutdown: &Shutdown,
    ) -> Result<Composed, ComposeFailure> {
        let mut shutdown = shutdown.clone();
        let mut request = ComposeRequest::new(text).with_source_hint(source_hint.map(String::from));

        for attempt in 1..=max_attempts {
            if shutdown.is_triggered() {
                return Err(ComposeFailure::Cancelled);
            }
            request.attempt = attempt;

            let result = tokio::select! {
                _ = shutdown.wait() => {
                    tracing::info!(text, attempt, "Compose abandoned on shutdown");
                    return Err(ComposeFailure::Cancelled);
                }
                result = tokio::time::timeout(self.attempt_timeout, self.composer.compose(&request)) => {
                    result.unwrap_or_else(|_| {
                        ComposeAttemptResult::TransientToolFailure(format!(
                            "attempt timed out after {}s",
                            self.attempt_timeout.as_secs()
                        ))
                    })
                }
            };

            match result {
                ComposeAttemptResult::Success(artifact) => {
                    tracing::info!(
                        text,
                        attempt,
                        path = %artifact.path.display(),
                        bytes = artifact.bytes,
                        "Composed artifact"
                    );
                    return Ok(Composed {
                        artifact,
                        attempts: attempt,
                    });
                }
                ComposeAttemptResult::TooLarge { source } => {
                    if request.source_hint.is_some() {
                        tracing::warn!(text, attempt, source = %source, "Hinted source renders too large, giving up");
                        return Err(ComposeFailure::NoSourceAvailable);
                    }
                    tracing::warn!(text, attempt, source = %source, "Output too large, excluding source");
                    request.excluded_sources.push(source);
                }
                ComposeAttemptResult::TransientToolFailure(reason) => {
                    tracing::warn!(text, attempt, reason = %reason, "Compose attempt failed, retrying");
                }
                ComposeAttemptResult::NoSourceAvailable => {
                    tracing::info!(text, attempt, "No source image available");
                    return Err(ComposeFailure::NoSourceAvailable);
                }
            }
        }

        tracing::warn!(text, attempts = max_attempts, "Compose attempts exhausted");
        Err(ComposeFailure::Exhausted { attempts: max_attempts })
    }
}
