//! Artifact downloads
//!
//! - `types.rs`: task state, events, refresh report
//! - `speed.rs`: moving-average transfer speed
//! - `transfer.rs`: byte sources (HTTP with Range resume)
//! - `coordinator.rs`: the task registry, retry loop and cleanup

pub mod coordinator;
pub mod speed;
pub mod transfer;
pub mod types;

pub use coordinator::{part_path, DownloadCoordinator};
pub use speed::SpeedMeter;
pub use transfer::{classify_status, ArtifactSource, HttpArtifactSource, TransferError, TransferResponse};
pub use types::{DownloadEvent, DownloadProgress, DownloadStatus, DownloadTask, RefreshReport};
