//! Publishing artifacts.
//!
//! A [`Poster`] publishes a text (optionally with media, optionally as a
//! reply) and reports failures as either [`PostError::Overloaded`], which
//! the retry policy retries, or [`PostError::Fatal`], which it does not.

mod dry_run;
mod retry;
mod telegram;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

pub use dry_run::DryRunPoster;
pub use retry::{PostRetryPolicy, post_with_retry};
pub use telegram::{TelegramConfig, TelegramPoster};

/// What to publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostPayload {
    pub text: String,
    pub media: Option<PathBuf>,
    /// Message being answered
    pub in_reply_to: Option<String>,
    /// Conversation to post into; the poster's default target when unset
    pub conversation: Option<String>,
}

impl PostPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_media(mut self, media: impl Into<PathBuf>) -> Self {
        self.media = Some(media.into());
        self
    }

    pub fn in_reply_to(mut self, id: impl Into<String>, conversation: Option<String>) -> Self {
        self.in_reply_to = Some(id.into());
        self.conversation = conversation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    /// Server-side trouble (overload, internal error, timeout); worth retrying
    #[error("Service overloaded: {0}")]
    Overloaded(String),

    /// Anything else: bad payload, auth, unknown chat
    #[error("Post failed: {0}")]
    Fatal(String),
}

impl PostError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PostError::Overloaded(_))
    }
}

#[async_trait]
pub trait Poster: Send + Sync {
    /// Publish and return a URL for the new post.
    async fn post(&self, payload: &PostPayload) -> std::result::Result<String, PostError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosterKind {
    #[default]
    DryRun,
    Telegram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostConfig {
    pub poster: PosterKind,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub telegram: TelegramConfig,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            poster: PosterKind::DryRun,
            retry_attempts: 5,
            retry_delay_ms: 2000,
            timeout_secs: 60,
            telegram: TelegramConfig::default(),
        }
    }
}

impl PostConfig {
    pub fn retry_policy(&self) -> PostRetryPolicy {
        PostRetryPolicy {
            attempts: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Build the configured poster.
pub fn build_poster(config: &PostConfig) -> Result<Arc<dyn Poster>> {
    let poster: Arc<dyn Poster> = match config.poster {
        PosterKind::DryRun => Arc::new(DryRunPoster::new()),
        PosterKind::Telegram => Arc::new(TelegramPoster::new(config.telegram.clone(), config.timeout_secs)?),
    };
    log::info!("Posting through {}", poster.name());
    Ok(poster)
}
