//! Candidate records
//!
//! A Candidate is an inbound social post that may be turned into a composed
//! image and posted. Candidates are written to the queue on arrival, read
//! (never mutated) during scoring, and discarded once the queue is cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::{CleanOptions, clean};

/// Engagement counters captured when the post was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    /// Likes/favorites on the post
    pub favorites: u64,
    /// Retweets/reposts of the post
    pub reposts: u64,
    /// Follower count of the author
    pub follower_count: u64,
    /// Language the author writes in, if known
    #[serde(default)]
    pub author_lang: Option<String>,
    /// When the post was created upstream
    pub created_at: DateTime<Utc>,
}

impl Engagement {
    /// Engagement with no interactions yet.
    pub fn new(follower_count: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            favorites: 0,
            reposts: 0,
            follower_count,
            author_lang: None,
            created_at,
        }
    }

    pub fn with_counts(mut self, favorites: u64, reposts: u64) -> Self {
        self.favorites = favorites;
        self.reposts = reposts;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.author_lang = Some(lang.into());
        self
    }
}

/// A unit of potential action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Handle of the post in the origin system
    pub id: String,
    /// Original, unprocessed text
    pub raw_text: String,
    /// Normalized text, computed once at construction
    pub cleaned_text: String,
    pub engagement: Engagement,
}

impl Candidate {
    /// Build a candidate, deriving its cleaned text.
    pub fn new(id: impl Into<String>, raw_text: impl Into<String>, engagement: Engagement) -> Self {
        let raw_text = raw_text.into();
        let cleaned_text = clean(&raw_text, CleanOptions::candidate());
        Self {
            id: id.into(),
            raw_text,
            cleaned_text,
            engagement,
        }
    }

    /// Age in whole seconds at `now`, never negative.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        let age = now.signed_duration_since(self.engagement.created_at);
        (age.num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// A candidate paired with its ranking score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_cleans_text_once() {
        let engagement = Engagement::new(100, Utc::now());
        let candidate = Candidate::new("42", "RT @bob: so  cute &amp; fluffy https://t.co/x", engagement);

        assert_eq!(candidate.id, "42");
        assert_eq!(candidate.cleaned_text, "so cute & fluffy");
        assert!(candidate.raw_text.starts_with("RT @bob"));
    }

    #[test]
    fn test_age_secs() {
        let now = Utc::now();
        let engagement = Engagement::new(10, now - Duration::seconds(90));
        let candidate = Candidate::new("1", "hello", engagement);
        assert!((candidate.age_secs(now) - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_age_secs_future_is_zero() {
        let now = Utc::now();
        let engagement = Engagement::new(10, now + Duration::seconds(30));
        let candidate = Candidate::new("1", "hello", engagement);
        assert_eq!(candidate.age_secs(now), 0.0);
    }

    #[test]
    fn test_unknown_fields_in_queue_line_are_ignored() {
        let line = r#"{"id":"7","raw_text":"text","cleaned_text":"text","engagement":{"favorites":3,"reposts":1,"follower_count":5,"created_at":"2024-05-01T12:00:00Z"},"source_hint":"https://img.example/a.jpg"}"#;
        let restored: Candidate = serde_json::from_str(line).unwrap();
        assert_eq!(restored.id, "7");
        assert_eq!(restored.engagement.follower_count, 5);
        assert!(!serde_json::to_string(&restored).unwrap().contains("source_hint"));
    }
}
