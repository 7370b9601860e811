//! Remote model catalog client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::LINK;
use serde::Deserialize;

use crate::error::ModelError;

use super::types::{FileDetails, HfModel, SearchPage, SearchQuery};

/// The remote model catalog
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ModelError>;

    /// Follow the opaque token from a previous page
    async fn next_page(&self, token: &str) -> Result<SearchPage, ModelError>;

    /// Sizes and checksums of every file in a repository
    async fn file_details(&self, repo_id: &str) -> Result<Vec<FileDetails>, ModelError>;
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    oid: String,
    size: u64,
}

/// Hugging Face models API over reqwest
pub struct HfCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HfCatalogClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pocketpal-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::Catalog(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_page(&self, request: reqwest::RequestBuilder) -> Result<SearchPage, ModelError> {
        let response = request
            .send()
            .await
            .map_err(|e| ModelError::Catalog(format!("Failed to fetch models: {}", e)))?;

        if !response.status().is_success() {
            return Err(ModelError::Catalog(format!(
                "Model search failed with status: {}",
                response.status()
            )));
        }

        let next_page = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link);

        let models: Vec<HfModel> = response
            .json()
            .await
            .map_err(|e| ModelError::Catalog(format!("Failed to parse models: {}", e)))?;

        log::debug!("Fetched {} models (more: {})", models.len(), next_page.is_some());
        Ok(SearchPage { models, next_page })
    }
}

#[async_trait]
impl RemoteCatalog for HfCatalogClient {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ModelError> {
        let url = format!("{}/api/models", self.base_url);
        self.fetch_page(self.client.get(url).query(&query.to_params()))
            .await
    }

    async fn next_page(&self, token: &str) -> Result<SearchPage, ModelError> {
        if !token.starts_with(&self.base_url) {
            return Err(ModelError::Catalog(format!("Unexpected page link: {}", token)));
        }
        self.fetch_page(self.client.get(token)).await
    }

    async fn file_details(&self, repo_id: &str) -> Result<Vec<FileDetails>, ModelError> {
        let url = format!("{}/api/models/{}/tree/main", self.base_url, repo_id);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelError::Catalog(format!("Failed to fetch files of {}: {}", repo_id, e)))?;

        if !response.status().is_success() {
            return Err(ModelError::Catalog(format!(
                "File listing for {} failed with status: {}",
                repo_id,
                response.status()
            )));
        }

        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|e| ModelError::Catalog(format!("Failed to parse file listing: {}", e)))?;

        Ok(tree_to_details(entries))
    }
}

fn tree_to_details(entries: Vec<TreeEntry>) -> Vec<FileDetails> {
    entries
        .into_iter()
        .filter(|e| e.kind == "file")
        .map(|e| match e.lfs {
            Some(lfs) => FileDetails {
                filename: e.path,
                size: lfs.size,
                sha256: Some(lfs.oid),
            },
            None => FileDetails {
                filename: e.path,
                size: e.size,
                sha256: None,
            },
        })
        .collect()
}

/// Extract the `rel="next"` target from a `Link` header
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if is_next && target.starts_with('<') && target.ends_with('>') {
            Some(target[1..target.len() - 1].to_string())
        } else {
            None
        }
    })
}
