//! Image search providers.
//!
//! A provider turns a phrase into a list of candidate images, each paired
//! with the page it was found on. Which provider is used is decided once at
//! startup from [`SearchConfig::provider`].

mod bing;
mod google;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AkariError, Result};

pub use bing::BingProvider;
pub use google::GoogleProvider;

/// Environment variable consulted when no api key is configured.
pub const API_KEY_ENV: &str = "AKARI_SEARCH_API_KEY";

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHit {
    pub image_url: String,
    /// Page the image was found on; sent as Referer when downloading
    pub source_url: String,
}

impl ImageHit {
    pub fn new(image_url: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            source_url: source_url.into(),
        }
    }
}

/// Image search capability.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Search for `text`. Any failure is logged and reported as no results.
    async fn search(&self, text: &str) -> Vec<ImageHit>;

    /// Provider name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("Search returned status {0}")]
    Status(u16),

    #[error("Unexpected response: {0}")]
    Parse(#[from] serde_json::Error),
}

// request URLs may carry an API key
impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        SearchError::Http(err.without_url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Bing,
    Google,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: ProviderKind,
    /// Falls back to `AKARI_SEARCH_API_KEY`
    pub api_key: Option<String>,
    /// Custom search engine id (Google only)
    pub engine_id: Option<String>,
    /// Override the provider's endpoint
    pub endpoint: Option<String>,
    /// Market / locale hint, e.g. "ja-JP"
    pub market: String,
    /// Hits whose page URL contains any of these are dropped
    pub banned_sources: Vec<String>,
    pub shuffle: bool,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Bing,
            api_key: None,
            engine_id: None,
            endpoint: None,
            market: "ja-JP".to_string(),
            banned_sources: Vec::new(),
            shuffle: true,
            timeout_secs: 15,
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(API_KEY_ENV)
            .map_err(|_| AkariError::Config(format!("search.api_key not set and {} missing", API_KEY_ENV)))
    }
}

/// Build the configured provider.
pub fn build_provider(config: &SearchConfig) -> Result<Arc<dyn ImageProvider>> {
    let api_key = config.resolve_api_key()?;
    let provider: Arc<dyn ImageProvider> = match config.provider {
        ProviderKind::Bing => Arc::new(BingProvider::new(api_key, config.clone())?),
        ProviderKind::Google => Arc::new(GoogleProvider::new(api_key, config.clone())?),
    };
    log::info!("Using {} image search", provider.name());
    Ok(provider)
}

fn http_client(config: &SearchConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| AkariError::Search(format!("Failed to create HTTP client: {}", e)))
}

/// Drop banned sources and optionally shuffle.
fn finalize(hits: Vec<ImageHit>, config: &SearchConfig) -> Vec<ImageHit> {
    let mut hits: Vec<ImageHit> = hits
        .into_iter()
        .filter(|hit| {
            let banned = config.banned_sources.iter().any(|b| hit.source_url.contains(b.as_str()));
            if banned {
                log::info!("Skipping banned source {}", hit.source_url);
            }
            !banned
        })
        .collect();

    if config.shuffle {
        hits.shuffle(&mut rand::thread_rng());
    }
    hits
}

/// Queries can't carry single quotes through some providers.
fn sanitize_query(text: &str) -> String {
    text.replace('\'', " ")
}
