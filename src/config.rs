//! Static configuration for the model manager
//!
//! Paths default to the platform data directory. Settings the user can change at
//! runtime (auto-release, acceleration, context size) live in the database instead,
//! see `database::ManagerSettings`.

use std::path::PathBuf;
use std::time::Duration;

/// Extra free space required on top of every storage request
pub const DEFAULT_STORAGE_MARGIN_BYTES: u64 = 100 * 1024 * 1024;

/// Default base URL of the remote model catalog
pub const DEFAULT_HUB_BASE_URL: &str = "https://huggingface.co";

/// Retry behaviour for transient download failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after every failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempts` consecutive failures
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Application storage root; models live under `<storage_root>/models`
    pub storage_root: PathBuf,
    /// SQLite database holding the catalog and manager settings
    pub db_path: PathBuf,
    pub storage_margin_bytes: u64,
    pub retry: RetryPolicy,
    /// Wall-clock interval between progress updates
    pub progress_interval: Duration,
    /// Number of progress samples in the speed moving average
    pub speed_window: usize,
    pub max_concurrent_downloads: usize,
    pub connect_timeout: Duration,
    /// Maximum time without receiving a chunk before an attempt is abandoned
    pub read_timeout: Duration,
    pub hub_base_url: String,
}

impl ManagerConfig {
    /// Configuration rooted at `storage_root`, with the database inside it
    pub fn with_storage_root(storage_root: PathBuf) -> Self {
        Self {
            db_path: storage_root.join("pocketpal.db"),
            storage_root,
            ..Self::default()
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.storage_root.join("models")
    }

    /// Directory for user-imported artifacts
    pub fn local_models_dir(&self) -> PathBuf {
        self.models_dir().join("local")
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let storage_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pocketpal");

        Self {
            db_path: storage_root.join("pocketpal.db"),
            storage_root,
            storage_margin_bytes: DEFAULT_STORAGE_MARGIN_BYTES,
            retry: RetryPolicy::default(),
            progress_interval: Duration::from_secs(1),
            speed_window: 5,
            max_concurrent_downloads: 2,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            hub_base_url: DEFAULT_HUB_BASE_URL.to_string(),
        }
    }
}
