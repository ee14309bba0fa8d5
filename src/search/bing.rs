//! Bing image search (v7 API)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{ImageHit, ImageProvider, SearchConfig, SearchError, finalize, http_client, sanitize_query};
use crate::error::Result;

const BING_IMAGES_URL: &str = "https://api.bing.microsoft.com/v7.0/images/search";

#[derive(Debug, Deserialize)]
struct BingResponse {
    #[serde(default)]
    value: Vec<BingImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingImage {
    content_url: String,
    #[serde(default)]
    host_page_url: String,
}

pub struct BingProvider {
    client: Client,
    api_key: String,
    config: SearchConfig,
}

impl BingProvider {
    pub fn new(api_key: String, config: SearchConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(&config)?,
            api_key,
            config,
        })
    }

    async fn fetch(&self, text: &str) -> std::result::Result<Vec<ImageHit>, SearchError> {
        let endpoint = self.config.endpoint.as_deref().unwrap_or(BING_IMAGES_URL);
        let query = sanitize_query(text);
        let response = self
            .client
            .get(endpoint)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .query(&[
                ("q", query.as_str()),
                ("mkt", self.config.market.as_str()),
                ("safeSearch", "Off"),
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
    let response: BingResponse = serde_json::from_str(body)?;
    Ok(response
        .value
        .into_iter()
        .map(|image| ImageHit::new(image.content_url, image.host_page_url))
        .collect())
}

#[async_trait]
impl ImageProvider for BingProvider {
    async fn search(&self, text: &str) -> Vec<ImageHit> {
        match self.fetch(text).await {
            Ok(hits) => {
                log::debug!("Bing returned {} hits for {:?}", hits.len(), text);
                finalize(hits, &self.config)
            }
            Err(e) => {
                log::warn!("Bing search for {:?} failed: {}", text, e);
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "bing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results() {
        let body = r#"{
            "_type": "Images",
            "value": [
                {"contentUrl": "http://img.example/a.jpg", "hostPageUrl": "http://page.example/a", "encodingFormat": "jpeg"},
                {"contentUrl": "http://img.example/b.png", "hostPageUrl": "http://page.example/b"}
            ]
        }"#;

        let hits = parse(body).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], ImageHit::new("http://img.example/a.jpg", "http://page.example/a"));
    }

    #[test]
    fn test_parse_no_value_is_empty() {
        assert!(parse(r#"{"_type": "Images"}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(matches!(parse("<html>"), Err(SearchError::Parse(_))));
    }
}
