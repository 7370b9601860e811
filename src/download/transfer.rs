//! Artifact transfer - the byte source behind the download coordinator

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use thiserror::Error;

use crate::error::ModelError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    /// Worth another attempt: connection, timeout, 5xx, 429, broken stream
    #[error("{0}")]
    Transient(String),
    /// Retrying will not help: 4xx, bad URL
    #[error("{0}")]
    Fatal(String),
}

/// An opened transfer
pub struct TransferResponse {
    /// Size of the whole artifact, when the server reports it
    pub total_bytes: Option<u64>,
    /// True when the body continues from the requested offset
    pub resumed: bool,
    pub stream: BoxStream<'static, Result<Bytes, TransferError>>,
}

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Open `url` starting at byte `offset`. Sources that cannot resume
    /// return the full body with `resumed: false`.
    async fn open(&self, url: &str, offset: u64) -> Result<TransferResponse, TransferError>;
}

/// Streams artifacts over HTTP with reqwest
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new(connect_timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("pocketpal-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::Io(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn send(&self, url: &str, offset: u64) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        request.send().await.map_err(|e| {
            if e.is_builder() {
                TransferError::Fatal(format!("Invalid download request: {}", e))
            } else {
                TransferError::Transient(format!("Failed to start download: {}", e))
            }
        })
    }
}

/// Map a non-success status to the matching failure class
pub fn classify_status(status: StatusCode) -> Option<TransferError> {
    if status.is_success() {
        None
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(TransferError::Transient(format!("Server returned {}", status)))
    } else {
        Some(TransferError::Fatal(format!("Download failed with status: {}", status)))
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn open(&self, url: &str, offset: u64) -> Result<TransferResponse, TransferError> {
        let mut response = self.send(url, offset).await?;

        // Partial file no longer matches the remote; start over
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            log::warn!("Server rejected resume at byte {} for {}, restarting", offset, url);
            response = self.send(url, 0).await?;
        }

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let resumed = response.status() == StatusCode::PARTIAL_CONTENT;
        let total_bytes = response
            .content_length()
            .map(|len| if resumed { len + offset } else { len });

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Transient(format!("Download error: {}", e))))
            .boxed();

        Ok(TransferResponse {
            total_bytes,
            resumed,
            stream,
        })
    }
}
