//! Inbound post routing.
//!
//! Every post observed upstream goes through [`Intake::classify`], which
//! decides whether it is noise, a timeline candidate for the scheduled
//! cycle, or an interactive request addressed to the bot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Candidate, Engagement};
use crate::text::{CleanOptions, clean};

/// Who wrote a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub handle: String,
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub lang: Option<String>,
}

/// A post as delivered by the upstream source, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundPost {
    pub id: String,
    pub text: String,
    pub author: Author,
    /// Client the post was made with
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub is_retweet: bool,
    #[serde(default)]
    pub favorites: u64,
    #[serde(default)]
    pub reposts: u64,
    pub created_at: DateTime<Utc>,
    /// First attached image, if any
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Chat/thread the post lives in, for replies
    #[serde(default)]
    pub conversation: Option<String>,
}

/// An interactive request addressed to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: String,
    /// Cleaned text with the bot's mention removed
    pub text: String,
    pub author: Author,
    /// User-supplied source image
    pub image_url: Option<String>,
    pub conversation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnPost,
    Retweet,
    SourceNotWhitelisted,
    /// Mentions someone other than the bot
    NotAddressed,
    RequestsDisabled,
    Empty,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            IgnoreReason::OwnPost => "own post",
            IgnoreReason::Retweet => "retweet",
            IgnoreReason::SourceNotWhitelisted => "source not whitelisted",
            IgnoreReason::NotAddressed => "not addressed to us",
            IgnoreReason::RequestsDisabled => "requests disabled",
            IgnoreReason::Empty => "empty after cleaning",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Ignore(IgnoreReason),
    Timeline(Candidate),
    Request(Request),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Our own handle, without the leading '@'
    pub self_handle: String,
    /// Allowed clients; empty allows all
    pub sources_whitelist: Vec<String>,
    /// Answer posts addressed to us
    pub user_requests: bool,
    /// Use images attached to requests as the source
    pub user_images: bool,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            self_handle: "akari_shoah".to_string(),
            sources_whitelist: Vec::new(),
            user_requests: true,
            user_images: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Intake {
    config: IntakeConfig,
    mention_prefix: String,
}

impl Intake {
    pub fn new(config: IntakeConfig) -> Self {
        let mention_prefix = format!("@{} ", config.self_handle.trim_start_matches('@').to_lowercase());
        Self { config, mention_prefix }
    }

    pub fn classify(&self, post: &InboundPost) -> Route {
        let self_handle = self.config.self_handle.trim_start_matches('@');
        if post.author.handle.trim_start_matches('@').eq_ignore_ascii_case(self_handle) {
            return Route::Ignore(IgnoreReason::OwnPost);
        }

        if post.is_retweet {
            return Route::Ignore(IgnoreReason::Retweet);
        }

        if !self.config.sources_whitelist.is_empty() {
            let allowed = post
                .source
                .as_ref()
                .is_some_and(|s| self.config.sources_whitelist.iter().any(|w| w == s));
            if !allowed {
                return Route::Ignore(IgnoreReason::SourceNotWhitelisted);
            }
        }

        let cleaned = clean(&post.text, CleanOptions::candidate());

        if post.text.to_lowercase().starts_with(&self.mention_prefix) {
            return self.route_request(post, cleaned);
        }

        if post.text.starts_with('@') {
            return Route::Ignore(IgnoreReason::NotAddressed);
        }

        if cleaned.is_empty() {
            return Route::Ignore(IgnoreReason::Empty);
        }

        let engagement = Engagement {
            favorites: post.favorites,
            reposts: post.reposts,
            follower_count: post.author.followers,
            author_lang: post.author.lang.clone(),
            created_at: post.created_at,
        };
        Route::Timeline(Candidate::new(post.id.clone(), post.text.clone(), engagement))
    }

    fn route_request(&self, post: &InboundPost, cleaned: String) -> Route {
        if !self.config.user_requests {
            return Route::Ignore(IgnoreReason::RequestsDisabled);
        }

        let image_url = if self.config.user_images {
            post.image_url.clone()
        } else {
            None
        };

        if cleaned.is_empty() && image_url.is_none() {
            return Route::Ignore(IgnoreReason::Empty);
        }

        Route::Request(Request {
            id: post.id.clone(),
            text: cleaned,
            author: post.author.clone(),
            image_url,
            conversation: post.conversation.clone(),
        })
    }
}
