// PocketPal core - on-device model lifecycle
//
// This crate manages the models of an on-device chat client:
// - Model catalog (bundled presets, imported files, remote bookmarks)
// - Resumable, cancellable artifact downloads with storage preflight
// - Per-model chat template and completion settings overrides
// - The single native inference context and its auto-release policy
// - Remote catalog search and bookmarking

pub mod catalog;
pub mod config;
pub mod context;
pub mod database;
pub mod download;
pub mod error;
pub mod hub;
pub mod settings;
pub mod state;
pub mod storage;

pub use catalog::{CatalogEvent, ModelCatalog, ModelEntry, ModelOrigin, RemoteFileRef};
pub use config::{ManagerConfig, RetryPolicy};
pub use context::{ContextEvent, ContextLifecycleManager, ContextParams, ContextState, HostSignal, InferenceRuntime};
pub use download::{DownloadCoordinator, DownloadEvent, DownloadStatus, DownloadTask};
pub use error::ModelError;
pub use hub::{CatalogBridge, HfModel, ModelFile, SearchPage, SearchQuery};
pub use settings::{ChatTemplateConfig, CompletionSettings, SettingsOverlay};
pub use state::{Collaborators, ModelServices};
pub use storage::StorageGuard;

/// Initialize env_logger on stderr (reads RUST_LOG, defaults to info).
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
