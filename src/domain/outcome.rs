//! Compose attempt outcome types.
//!
//! The composer boundary never throws for control flow: every attempt comes
//! back as a tagged [`ComposeAttemptResult`] that the retry controller
//! classifies.

use std::path::PathBuf;

/// A postable image plus the caption that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Where the composed file was written
    pub path: PathBuf,
    /// Caption rendered onto / posted with the image
    pub caption: String,
    /// Source image the artifact was composed from
    pub source: Option<String>,
    /// Size of the composed file in bytes
    pub bytes: u64,
}

/// What the composer is asked to do on one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRequest {
    /// Text to search for and caption with
    pub text: String,
    /// Use exactly this source image instead of searching
    pub source_hint: Option<String>,
    /// Sources already known to produce unusable output
    pub excluded_sources: Vec<String>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl ComposeRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_hint: None,
            excluded_sources: Vec::new(),
            attempt: 1,
        }
    }

    pub fn with_source_hint(mut self, source: Option<String>) -> Self {
        self.source_hint = source;
        self
    }

    /// Whether a source was rejected by an earlier attempt.
    pub fn is_excluded(&self, source: &str) -> bool {
        self.excluded_sources.iter().any(|s| s == source)
    }
}

/// Outcome of one compose attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeAttemptResult {
    /// Artifact ready to post
    Success(Artifact),
    /// Output exceeded the byte ceiling; the same source will always do that
    TooLarge { source: String },
    /// The renderer silently failed (no output); same inputs may work
    TransientToolFailure(String),
    /// No usable source image for this text
    NoSourceAvailable,
}

impl ComposeAttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ComposeAttemptResult::Success(_))
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ComposeAttemptResult::Success(_) => "success",
            ComposeAttemptResult::TooLarge { .. } => "too_large",
            ComposeAttemptResult::TransientToolFailure(_) => "transient_tool_failure",
            ComposeAttemptResult::NoSourceAvailable => "no_source_available",
        }
    }
}
