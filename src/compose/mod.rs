//! Turning text into a postable image.
//!
//! - [`Composer`]: one attempt, always answered with a tagged
//!   [`ComposeAttemptResult`](crate::domain::ComposeAttemptResult)
//! - [`ComposeRetryController`]: the bounded retry policy on top
//! - [`CommandComposer`]: search, download and an external render command

mod caption;
mod command;
mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ComposeAttemptResult, ComposeRequest};

pub use caption::CaptionStyle;
pub use command::{CommandComposer, text_hash};
pub use retry::{ComposeFailure, ComposeRetryController, Composed};

/// One compose attempt.
#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, request: &ComposeRequest) -> ComposeAttemptResult;
}

/// Compose configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    /// Render command argv. `{input}`, `{output}` and `{caption}` are
    /// substituted per argument; no shell is involved.
    pub render_command: Vec<String>,
    /// Extension of the rendered file
    pub output_extension: String,
    /// Largest source image we will download
    pub max_source_bytes: u64,
    /// Largest artifact the poster accepts
    pub max_artifact_bytes: u64,
    pub caption_style: CaptionStyle,
    /// Phrase picking for timeline candidates
    pub min_words: usize,
    pub max_words: usize,
    pub min_phrase_len: usize,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            max_attempts: ComposeRetryController::DEFAULT_MAX_ATTEMPTS,
            attempt_timeout_secs: ComposeRetryController::DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
            render_command: [
                "magick",
                "{input}",
                "-resize",
                "800x600^",
                "-gravity",
                "center",
                "-extent",
                "800x600",
                "-gravity",
                "south",
                "-pointsize",
                "48",
                "-fill",
                "white",
                "-stroke",
                "black",
                "-annotate",
                "+0+20",
                "{caption}",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            output_extension: "png".to_string(),
            max_source_bytes: 10 * 1024 * 1024,
            max_artifact_bytes: 3 * 1024 * 1024,
            caption_style: CaptionStyle::Akari,
            min_words: 1,
            max_words: 4,
            min_phrase_len: 4,
        }
    }
}

impl ComposeConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn phrase_picker(&self) -> crate::text::PhrasePicker {
        crate::text::PhrasePicker {
            min_words: self.min_words,
            max_words: self.max_words,
            min_len: self.min_phrase_len,
            ..Default::default()
        }
    }
}
