//! Web and image search through the Brave Search API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub description: String,
    pub url: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn web(&self, query: &str) -> Result<Vec<SearchHit>, DispatchError>;

    /// Direct image URLs.
    async fn images(&self, query: &str) -> Result<Vec<String>, DispatchError>;
}

/// Render web results as context for the model's follow-up turn.
pub fn format_web_results(query: &str, hits: &[SearchHit]) -> String {
    let body = if hits.is_empty() {
        "[no results found]".to_string()
    } else {
        hits.iter()
            .enumerate()
            .map(|(i, hit)| format!("{}. {}\n   {}\n   {}", i + 1, hit.title, hit.description, hit.url))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!("[Search results for '{query}']:\n{body}")
}

pub struct BraveSearch {
    client: reqwest::Client,
    endpoint: String,
    image_endpoint: String,
    api_key: Option<String>,
    result_count: usize,
    image_count: usize,
}

#[derive(Deserialize)]
struct WebResponse {
    #[serde(default)]
    web: Option<WebResults>,
}

#[derive(Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<WebResult>,
}

#[derive(Deserialize)]
struct WebResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    results: Vec<ImageResult>,
}

#[derive(Deserialize)]
struct ImageResult {
    #[serde(default)]
    properties: Option<ImageProperties>,
}

#[derive(Deserialize)]
struct ImageProperties {
    url: Option<String>,
}

impl BraveSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            image_endpoint: config.image_endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            result_count: config.result_count,
            image_count: config.image_count,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
        count: usize,
    ) -> Result<T, DispatchError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| DispatchError::Unavailable("search API key not configured".into()))?;

        let url = reqwest::Url::parse_with_params(
            endpoint,
            &[("q", query), ("count", count.to_string().as_str())],
        )
        .map_err(|e| DispatchError::Unknown(format!("invalid search endpoint: {e}")))?;

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout(10)
                } else {
                    DispatchError::Unavailable(format!("search request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Unavailable(format!("search returned HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| DispatchError::Unknown(format!("invalid search response: {e}")))
    }
}

#[async_trait]
impl SearchProvider for BraveSearch {
    async fn web(&self, query: &str) -> Result<Vec<SearchHit>, DispatchError> {
        let body: WebResponse = self.get(&self.endpoint, query, self.result_count).await?;
        let hits: Vec<SearchHit> = body
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(self.result_count)
            .map(|r| SearchHit {
                title: r.title,
                description: r.description,
                url: r.url,
            })
            .collect();
        debug!(query = %query, hits = hits.len(), "web search");
        Ok(hits)
    }

    async fn images(&self, query: &str) -> Result<Vec<String>, DispatchError> {
        let body: ImageResponse = self.get(&self.image_endpoint, query, self.image_count).await?;
        let urls: Vec<String> = body
            .results
            .into_iter()
            .filter_map(|r| r.properties.and_then(|p| p.url))
            .take(self.image_count)
            .collect();
        debug!(query = %query, images = urls.len(), "image search");
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, key: Option<&str>) -> SearchConfig {
        SearchConfig {
            endpoint: format!("{}/web", server.uri()),
            image_endpoint: format!("{}/images", server.uri()),
            api_key: key.map(str::to_string),
            result_count: 2,
            image_count: 2,
        }
    }

    #[tokio::test]
    async fn web_results_are_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/web"))
            .and(query_param("q", "rust async"))
            .and(header("X-Subscription-Token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": {"results": [
                    {"title": "Async Book", "description": "Learn async", "url": "https://a"},
                    {"title": "Tokio", "description": "Runtime", "url": "https://b"},
                    {"title": "Extra", "description": "dropped", "url": "https://c"}
                ]}
            })))
            .mount(&server)
            .await;

        let search = BraveSearch::new(&config(&server, Some("secret"))).unwrap();
        let hits = search.web("rust async").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Async Book");

        let text = format_web_results("rust async", &hits);
        assert!(text.starts_with("[Search results for 'rust async']"));
        assert!(text.contains("2. Tokio"));
    }

    #[tokio::test]
    async fn image_urls_come_from_properties() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"properties": {"url": "https://img/1.jpg"}},
                    {"thumbnail": {"src": "ignored"}},
                    {"properties": {"url": "https://img/2.jpg"}}
                ]
            })))
            .mount(&server)
            .await;

        let search = BraveSearch::new(&config(&server, Some("k"))).unwrap();
        assert_eq!(
            search.images("gatos").await.unwrap(),
            vec!["https://img/1.jpg", "https://img/2.jpg"]
        );
    }

    #[tokio::test]
    async fn missing_key_is_unavailable() {
        let server = MockServer::start().await;
        let search = BraveSearch::new(&config(&server, None)).unwrap();
        assert!(matches!(
            search.web("x").await,
            Err(DispatchError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn http_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        let search = BraveSearch::new(&config(&server, Some("k"))).unwrap();
        assert!(matches!(
            search.web("x").await,
            Err(DispatchError::Unavailable(_))
        ));
    }

    #[test]
    fn empty_results_are_stated() {
        assert!(format_web_results("q", &[]).contains("no results"));
    }
}
