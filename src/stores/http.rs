use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{GraphPassage, GraphStore, WebHit, WebSearch};
use crate::config::{GraphStoreConfig, WebSearchConfig};
use crate::error::{StoreError, StoreResult};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// HTTP-backed knowledge-graph store collaborator
#[derive(Clone)]
pub struct HttpGraphStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct RetrieveRequest<'a> {
    query: &'a str,
    country: &'a str,
    top_k: usize,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    passages: Vec<GraphPassage>,
}

impl HttpGraphStore {
    /// Create a new graph store client
    pub fn new(config: &GraphStoreConfig) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(StoreError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    async fn retrieve(
        &self,
        query: &str,
        country: &str,
        top_k: usize,
    ) -> StoreResult<Vec<GraphPassage>> {
        let url = format!("{}/v1/retrieve", self.base_url);

        debug!(query_len = query.len(), country = %country, top_k, "Graph retrieval");

        let mut request = self
            .client
            .post(&url)
            .json(&RetrieveRequest { query, country, top_k });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(StoreError::Http)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Graph {
                message: format!("{} - {}", status.as_u16(), body),
            });
        }

        let parsed: RetrieveResponse =
            response.json().await.map_err(|e| StoreError::Graph {
                message: format!("Failed to parse retrieval response: {}", e),
            })?;

        Ok(parsed.passages)
    }
}

/// HTTP-backed web-search collaborator
#[derive(Clone)]
pub struct HttpWebSearch {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_results: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<WebHit>,
}

impl HttpWebSearch {
    /// Create a new web-search client
    pub fn new(config: &WebSearchConfig) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(StoreError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl WebSearch for HttpWebSearch {
    async fn search(&self, query: &str, max_results: usize) -> StoreResult<Vec<WebHit>> {
        let url = format!("{}/search", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .json(&SearchRequest { query, max_results });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(StoreError::Http)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Web {
                message: format!("{} - {}", status.as_u16(), body),
            });
        }

        let parsed: SearchResponse = response.json().await.map_err(|e| StoreError::Web {
            message: format!("Failed to parse search response: {}", e),
        })?;

        Ok(parsed.results)
    }
}
