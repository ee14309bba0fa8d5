//! Interactive requests.
//!
//! A request addressed to the bot is screened (blacklist, then rate-limit
//! tiers), composed with the user's text and optional image, and answered
//! in-thread. Compose failures still get an answer: a fallback message
//! without media.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::compose::{ComposeFailure, ComposeRetryController};
use crate::error::Result;
use crate::intake::Request;
use crate::post::{PostError, PostPayload, PostRetryPolicy, Poster, post_with_retry};
use crate::ratelimit::RateLimiter;
use crate::shutdown::Shutdown;
use crate::text::{MAX_STATUS_LENGTH, MAX_STATUS_WITH_MEDIA_LENGTH, ellipsis, humanize};

/// One rate-limit layer applied to every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTier {
    /// Counter identity for shared tiers; also used in logs
    pub name: String,
    pub scope: String,
    pub max: u32,
    pub ttl_secs: u64,
    /// Only enforced for authors with fewer followers than this
    #[serde(default)]
    pub below_followers: Option<u64>,
    /// Count each author separately instead of sharing one counter
    #[serde(default)]
    pub per_identity: bool,
}

impl RateLimitTier {
    fn identity<'a>(&'a self, request: &'a Request) -> &'a str {
        if self.per_identity {
            &request.author.handle
        } else {
            &self.name
        }
    }

    fn applies_to(&self, request: &Request) -> bool {
        self.below_followers
            .is_none_or(|threshold| request.author.followers < threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
    /// Regexes searched in the cleaned request text
    pub blacklist: Vec<String>,
    pub tiers: Vec<RateLimitTier>,
    /// Handles never rate limited
    pub exemptions: Vec<String>,
    /// Put the caption in the reply text, not just the image
    pub text_in_status: bool,
    pub no_results_messages: Vec<String>,
    pub error_messages: Vec<String>,
    /// Appended to error messages
    pub error_suffix: String,
    pub throttle_message: String,
    /// Worker tasks for `listen`
    pub workers: usize,
    /// Requests waiting for a worker before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            tiers: vec![
                RateLimitTier {
                    name: "global_slow".to_string(),
                    scope: "requests".to_string(),
                    max: 5,
                    ttl_secs: 60,
                    below_followers: Some(25),
                    per_identity: false,
                },
                RateLimitTier {
                    name: "global".to_string(),
                    scope: "requests".to_string(),
                    max: 20,
                    ttl_secs: 60,
                    below_followers: None,
                    per_identity: false,
                },
            ],
            exemptions: Vec::new(),
            text_in_status: false,
            no_results_messages: [
                "I found nothing.",
                "No results.",
                "I didn't find anything.",
                "There are no results.",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            error_messages: [
                "Can't hear ya...",
                "Ooops, I'm busy at the moment.",
                "I don't feel so well right now.",
                "Sorry, I fell asleep.",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            error_suffix: " Try again a bit later.".to_string(),
            throttle_message: "Not so fast! Try again in {wait}.".to_string(),
            workers: 3,
            queue_capacity: 32,
        }
    }
}

/// Compiled request blacklist.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    patterns: Vec<Regex>,
}

impl Blacklist {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let patterns = patterns.iter().map(|p| Regex::new(p)).collect::<std::result::Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// The first pattern found in `text`.
    pub fn matches(&self, text: &str) -> Option<&str> {
        self.patterns.iter().find(|re| re.is_match(text)).map(|re| re.as_str())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// What became of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Not answered at all
    Ignored { reason: String },
    /// A shared tier is closed; dropped without a reply
    Dropped { tier: String, reset_secs: u64 },
    Posted {
        url: String,
        text: String,
        with_media: bool,
        /// Answered with a fallback or throttle message instead of an image
        fallback: bool,
    },
    PostFailed(PostError),
    Cancelled,
}

pub struct RequestHandler {
    config: RequestsConfig,
    blacklist: Blacklist,
    exemptions: HashSet<String>,
    limiter: RateLimiter,
    controller: Arc<ComposeRetryController>,
    poster: Arc<dyn Poster>,
    post_retry: PostRetryPolicy,
    shutdown: Shutdown,
}

impl RequestHandler {
    pub fn new(
        config: RequestsConfig,
        limiter: RateLimiter,
        controller: Arc<ComposeRetryController>,
        poster: Arc<dyn Poster>,
    ) -> Result<Self> {
        let blacklist = Blacklist::compile(&config.blacklist)?;
        let exemptions = config.exemptions.iter().map(|h| normalize_handle(h)).collect();
        log::debug!(
            "Request handler ready: {} blacklist patterns, {} tiers, {} exemptions",
            blacklist.len(),
            config.tiers.len(),
            config.exemptions.len()
        );

        Ok(Self {
            config,
            blacklist,
            exemptions,
            limiter,
            controller,
            poster,
            post_retry: PostRetryPolicy::default(),
            shutdown: Shutdown::never(),
        })
    }

    pub fn with_post_retry(mut self, policy: PostRetryPolicy) -> Self {
        self.post_retry = policy;
        self
    }

    /// Abandon in-flight composes when this fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn handle(&self, request: &Request) -> Reply {
        if let Some(pattern) = self.blacklist.matches(&request.text) {
            tracing::info!(request = %request.id, author = %request.author.handle, pattern, "Request blacklisted");
            return Reply::Ignored {
                reason: format!("blacklisted by {}", pattern),
            };
        }

        if let Some(reply) = self.throttle(request).await {
            return reply;
        }

        let composed = self
            .controller
            .try_compose(&request.text, request.image_url.as_deref(), &self.shutdown)
            .await;

        let (text, media, fallback) = match composed {
            Ok(composed) => {
                let text = if self.config.text_in_status {
                    format!("@{} {}", request.author.handle, composed.artifact.caption)
                } else {
                    format!("@{}", request.author.handle)
                };
                (text, Some(composed.artifact.path), false)
            }
            Err(ComposeFailure::Cancelled) => return Reply::Cancelled,
            Err(ComposeFailure::NoSourceAvailable) => {
                let message = pick(&self.config.no_results_messages, "No results.");
                (format!("@{} {}", request.author.handle, message), None, true)
            }
            Err(e @ ComposeFailure::Exhausted { .. }) => {
                tracing::warn!(request = %request.id, error = %e, "Request compose failed");
                let message = pick(&self.config.error_messages, "Ooops, I'm busy at the moment.");
                (
                    format!("@{} {}{}", request.author.handle, message, self.config.error_suffix),
                    None,
                    true,
                )
            }
        };

        self.answer(request, text, media, fallback).await
    }

    /// Apply every tier in order; the first closed one decides.
    async fn throttle(&self, request: &Request) -> Option<Reply> {
        if self.exemptions.contains(&normalize_handle(&request.author.handle)) {
            return None;
        }

        for tier in &self.config.tiers {
            let identity = tier.identity(request);
            let result = self
                .limiter
                .check(&tier.scope, identity, tier.max, Duration::from_secs(tier.ttl_secs))
                .await;
            if result.allowed || !tier.applies_to(request) {
                continue;
            }

            if !tier.per_identity {
                tracing::info!(
                    request = %request.id,
                    tier = %tier.name,
                    reset_secs = result.reset_secs,
                    "Request dropped by shared rate limit"
                );
                return Some(Reply::Dropped {
                    tier: tier.name.clone(),
                    reset_secs: result.reset_secs,
                });
            }

            let notice = self
                .config
                .throttle_message
                .replace("{wait}", &humanize(result.reset_secs));
            let text = format!("@{} {}", request.author.handle, notice);
            return Some(self.answer(request, text, None, true).await);
        }

        None
    }

    async fn answer(
        &self,
        request: &Request,
        text: String,
        media: Option<std::path::PathBuf>,
        fallback: bool,
    ) -> Reply {
        let limit = if media.is_some() {
            MAX_STATUS_WITH_MEDIA_LENGTH
        } else {
            MAX_STATUS_LENGTH
        };
        let text = ellipsis(&text, limit);
        let with_media = media.is_some();

        let mut payload = PostPayload::text(text.clone()).in_reply_to(request.id.clone(), request.conversation.clone());
        payload.media = media;

        match post_with_retry(self.poster.as_ref(), &payload, &self.post_retry).await {
            Ok(url) => Reply::Posted {
                url,
                text,
                with_media,
                fallback,
            },
            Err(e) => {
                tracing::error!(request = %request.id, error = %e, "Reply failed");
                Reply::PostFailed(e)
            }
        }
    }
}

fn normalize_handle(handle: &str) -> String {
    handle.trim_start_matches('@').to_lowercase()
}

fn pick<'a>(messages: &'a [String], default: &'a str) -> &'a str {
    messages
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .unwrap_or(default)
}
