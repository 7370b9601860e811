//! Error types for model lifecycle operations
//!
//! Split the way the UI needs it: transient failures offer a retry action,
//! structural failures explain the precondition that has to change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the catalog, download, context and settings components
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail")]
pub enum ModelError {
    /// Not enough free device storage for the requested operation
    #[error("Insufficient storage: {required_bytes} bytes required, {available_bytes} bytes available")]
    InsufficientStorage {
        required_bytes: u64,
        available_bytes: u64,
    },
    /// A download task already exists for this model
    #[error("Download already in progress for model: {0}")]
    AlreadyDownloading(String),
    /// The artifact is already on disk
    #[error("Model is already downloaded: {0}")]
    AlreadyDownloaded(String),
    /// The entry has no remote source to download from
    #[error("Model has no download source: {0}")]
    NotDownloadable(String),
    /// Download failed after retries, or with a non-retryable error
    #[error("Download failed for {model_id}: {reason}")]
    DownloadFailed {
        model_id: String,
        reason: String,
        retryable: bool,
    },
    /// Another context transition is in flight
    #[error("Context busy: {0}")]
    ContextBusy(String),
    /// The native runtime refused to load the model
    #[error("Failed to load model {model_id}: {reason}")]
    ContextLoadFailed { model_id: String, reason: String },
    /// The model cannot be removed in its current state
    #[error("Cannot remove model {model_id}: {reason}")]
    RemovalBlocked { model_id: String, reason: String },
    /// The catalog says the artifact exists but it is not on disk
    #[error("Model file missing for {0}")]
    ArtifactMissing(String),
    /// Unknown model id
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    /// An entry with this id already exists
    #[error("Model already exists: {0}")]
    AlreadyExists(String),
    /// A patch failed validation before merge
    #[error("Invalid patch for {model_id}: {reason}")]
    InvalidPatch { model_id: String, reason: String },
    /// A manager setting was out of range
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
    /// The remote model catalog failed
    #[error("Catalog request failed: {0}")]
    Catalog(String),
    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(String),
    /// The persisted store failed
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl ModelError {
    /// Whether the UI should offer a retry action for this error
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::DownloadFailed { retryable, .. } => *retryable,
            ModelError::Catalog(_) | ModelError::Io(_) => true,
            _ => false,
        }
    }

    /// Text shown to the user
    pub fn user_message(&self) -> String {
        match self {
            ModelError::InsufficientStorage { required_bytes, available_bytes } => format!(
                "Not enough storage space. This model needs {} but only {} is free.",
                format_bytes(*required_bytes),
                format_bytes(*available_bytes)
            ),
            ModelError::RemovalBlocked { reason, .. } => reason.clone(),
            ModelError::ContextBusy(_) => {
                "Another model is loading or unloading. Wait for it to finish and try again.".to_string()
            }
            ModelError::ArtifactMissing(_) => {
                "The model file is missing. Download or import it again.".to_string()
            }
            ModelError::DownloadFailed { retryable: true, .. } => {
                "Download failed because of a network problem. Tap to retry.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self {
        ModelError::Io(e.to_string())
    }
}

impl From<anyhow::Error> for ModelError {
    fn from(e: anyhow::Error) -> Self {
        ModelError::Persistence(format!("{:#}", e))
    }
}

/// Human-readable byte count (binary units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
