//! Download task state and the events published while it runs

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for a download slot
    Queued,
    Downloading,
    /// Cancel requested; no further progress is published
    Cancelling,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// Snapshot of a live download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub task_id: Uuid,
    pub model_id: String,
    pub dest_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    /// Failed attempts so far
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(model_id: &str, dest_path: PathBuf, total_bytes: u64) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            model_id: model_id.to_string(),
            dest_path,
            bytes_downloaded: 0,
            total_bytes,
            status: DownloadStatus::Queued,
            retry_count: 0,
            started_at: Utc::now(),
        }
    }

    /// Fraction complete, 0.0 when the size is unknown
    pub fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0) as f32
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DownloadProgress {
    pub model_id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub progress: f32,
    pub speed_bytes_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        model_id: String,
        total_bytes: u64,
    },
    Progress(DownloadProgress),
    /// A transient failure; the next attempt starts after `delay_ms`
    Retrying {
        model_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Completed {
        model_id: String,
        path: PathBuf,
    },
    Failed {
        model_id: String,
        error: ModelError,
        retryable: bool,
    },
    Cancelled {
        model_id: String,
    },
}

impl DownloadEvent {
    pub fn model_id(&self) -> &str {
        match self {
            DownloadEvent::Started { model_id, .. }
            | DownloadEvent::Retrying { model_id, .. }
            | DownloadEvent::Completed { model_id, .. }
            | DownloadEvent::Failed { model_id, .. }
            | DownloadEvent::Cancelled { model_id } => model_id,
            DownloadEvent::Progress(p) => &p.model_id,
        }
    }
}

/// What `refresh_download_statuses` changed
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RefreshReport {
    /// One `ArtifactMissing` per entry whose file disappeared
    pub missing: Vec<ModelError>,
    /// Entries whose stale progress was reset
    pub reset_progress: Vec<String>,
    /// Orphaned partial files that were deleted
    pub removed_partials: Vec<PathBuf>,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.reset_progress.is_empty() && self.removed_partials.is_empty()
    }
}
