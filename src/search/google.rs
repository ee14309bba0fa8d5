//! Google Custom Search, image mode

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{ImageHit, ImageProvider, SearchConfig, SearchError, finalize, http_client, sanitize_query};
use crate::error::{AkariError, Result};

const GOOGLE_CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleItem {
    link: String,
    #[serde(default)]
    image: Option<GoogleImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleImage {
    #[serde(default)]
    context_link: String,
}

pub struct GoogleProvider {
    client: Client,
    api_key: String,
    engine_id: String,
    config: SearchConfig,
}

impl GoogleProvider {
    pub fn new(api_key: String, config: SearchConfig) -> Result<Self> {
        let engine_id = config
            .engine_id
            .clone()
            .ok_or_else(|| AkariError::Config("search.engine_id is required for google".to_string()))?;
        Ok(Self {
            client: http_client(&config)?,
            api_key,
            engine_id,
            config,
        })
    }

    async fn fetch(&self, text: &str) -> std::result::Result<Vec<ImageHit>, SearchError> {
        let endpoint = self.config.endpoint.as_deref().unwrap_or(GOOGLE_CSE_URL);
        let query = sanitize_query(text);
        let response = self
            .client
            .get(endpoint)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query.as_str()),
                ("searchType", "image"),
                ("safe", "off"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse(&body)
    }
}

fn parse(body: &str) -> std::result::Result<Vec<ImageHit>, SearchError> {
    let response: GoogleResponse = serde_json::from_str(body)?;
    Ok(response
        .items
        .into_iter()
        .map(|item| {
            let source = item.image.map(|i| i.context_link).unwrap_or_default();
            ImageHit::new(item.link, source)
        })
        .collect())
}

#[async_trait]
impl ImageProvider for GoogleProvider {
    async fn search(&self, text: &str) -> Vec<ImageHit> {
        match self.fetch(text).await {
            Ok(hits) => {
                log::debug!("Google returned {} hits for {:?}", hits.len(), text);
                finalize(hits, &self.config)
            }
            Err(e) => {
                log::warn!("Google search for {:?} failed: {}", text, e);
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "google"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results() {
        let body = r#"{
            "kind": "customsearch#search",
            "items": [
                {"link": "http://img.example/a.jpg", "mime": "image/jpeg", "image": {"contextLink": "http://page.example/a"}},
                {"link": "http://img.example/b.png"}
            ]
        }"#;

        let hits = parse(body).unwrap();
        assert_eq!(
            hits,
            vec![
                ImageHit::new("http://img.example/a.jpg", "http://page.example/a"),
                ImageHit::new("http://img.example/b.png", ""),
            ]
        );
    }

    #[test]
    fn test_parse_no_items_is_empty() {
        assert!(parse(r#"{"kind": "customsearch#search"}"#).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_hides_api_key() {
        let config = SearchConfig {
            engine_id: Some("cx".to_string()),
            endpoint: Some("http://127.0.0.1:9/customsearch".to_string()),
            ..Default::default()
        };
        let provider = GoogleProvider::new("SECRET-key".to_string(), config).unwrap();

        let err = provider.fetch("cats").await.unwrap_err();
        assert!(!err.to_string().contains("SECRET"), "key leaked: {}", err);
    }

    #[test]
    fn test_new_requires_engine_id() {
        let result = GoogleProvider::new("key".to_string(), SearchConfig::default());
        assert!(matches!(result, Err(AkariError::Config(_))));
    }
}
