//! Remote model catalog types (Hugging Face models API shapes)

use serde::{Deserialize, Serialize};

/// A repository returned by a catalog search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HfModel {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub siblings: Vec<ModelFile>,
    /// Repository page, filled in by the bridge
    #[serde(default)]
    pub url: String,
}

/// One artifact in a repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Direct download link, filled in by the bridge
    #[serde(default)]
    pub download_url: String,
    /// Whether the file fits in free storage, filled in by `enrich`
    #[serde(default)]
    pub fits_in_storage: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub search: String,
    pub author: Option<String>,
    pub filter: Option<String>,
    pub sort: String,
    /// -1 for descending
    pub direction: i32,
    pub limit: u32,
    pub full: bool,
    pub config: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            search: String::new(),
            author: None,
            filter: Some("gguf".to_string()),
            sort: "downloads".to_string(),
            direction: -1,
            limit: 10,
            full: true,
            config: false,
        }
    }
}

impl SearchQuery {
    pub fn text(search: &str) -> Self {
        Self {
            search: search.to_string(),
            ..Self::default()
        }
    }

    /// Query string pairs in the models API format
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("search", self.search.clone()),
            ("sort", self.sort.clone()),
            ("direction", self.direction.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(author) = &self.author {
            params.push(("author", author.clone()));
        }
        if let Some(filter) = &self.filter {
            params.push(("filter", filter.clone()));
        }
        if self.full {
            params.push(("full", "true".to_string()));
        }
        if self.config {
            params.push(("config", "true".to_string()));
        }
        params
    }
}

/// One page of results plus the opaque token for the next page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchPage {
    pub models: Vec<HfModel>,
    pub next_page: Option<String>,
}

/// Size and checksum of a repository file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDetails {
    pub filename: String,
    pub size: u64,
    pub sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_models_response() {
        let body = r#"[
            {
                "id": "bartowski/gemma-2-2b-it-GGUF",
                "author": "bartowski",
                "downloads": 12345,
                "likes": 67,
                "tags": ["gguf", "text-generation"],
                "lastModified": "2024-08-01T00:00:00.000Z",
                "siblings": [
                    {"rfilename": "README.md"},
                    {"rfilename": "gemma-2-2b-it-Q4_K_M.gguf"}
                ]
            },
            {"id": "someone/empty"}
        ]"#;

        let models: Vec<HfModel> = serde_json::from_str(body).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].siblings.len(), 2);
        assert_eq!(models[0].last_modified.as_deref(), Some("2024-08-01T00:00:00.000Z"));
        assert!(models[1].siblings.is_empty());
        assert_eq!(models[1].downloads, 0);
    }

    #[test]
    fn test_default_query_params() {
        let params = SearchQuery::text("llama").to_params();
        assert!(params.contains(&("search", "llama".to_string())));
        assert!(params.contains(&("filter", "gguf".to_string())));
        assert!(params.contains(&("direction", "-1".to_string())));
        assert!(params.contains(&("limit", "10".to_string())));
        assert!(params.contains(&("full", "true".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "config"));
    }
}
