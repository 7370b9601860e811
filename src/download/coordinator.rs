//! Download coordinator - concurrent, cancellable artifact downloads
//!
//! One task per model id, registered atomically in a `DashMap`. Each task owns a
//! worker that streams into `<dest>.part`, retries transient failures with backoff
//! (resuming with a Range request when possible) and renames the file into place
//! on success. Progress and status changes share the task lock, so once a task is
//! `Cancelling` it publishes nothing but its `Cancelled` event.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{EntryPatch, ModelCatalog, ModelOrigin, RemoteFileRef};
use crate::config::{ManagerConfig, RetryPolicy};
use crate::error::ModelError;
use crate::storage::StorageGuard;

use super::speed::SpeedMeter;
use super::transfer::{ArtifactSource, TransferError};
use super::types::{DownloadEvent, DownloadProgress, DownloadStatus, DownloadTask, RefreshReport};

const EVENT_CAPACITY: usize = 1024;
const PART_EXTENSION: &str = "part";

/// Temp path a download streams into before the final rename
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".");
    name.push(PART_EXTENSION);
    PathBuf::from(name)
}

#[derive(Clone)]
struct TaskHandle {
    task: Arc<Mutex<DownloadTask>>,
    task_id: Uuid,
    dest_path: PathBuf,
    cancel: CancellationToken,
    /// Cancelled when the worker has exited and cleaned up
    finished: CancellationToken,
}

enum AttemptError {
    Transient(String),
    Fatal(String),
    /// A precondition no longer holds; reported as-is, never retried
    Rejected(ModelError),
    Cancelled,
}

impl From<TransferError> for AttemptError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Transient(reason) => AttemptError::Transient(reason),
            TransferError::Fatal(reason) => AttemptError::Fatal(reason),
        }
    }
}

enum Outcome {
    Completed { path: PathBuf, size: u64 },
    Failed { reason: String, retryable: bool },
    Rejected(ModelError),
    Cancelled,
}

struct Inner {
    catalog: Arc<ModelCatalog>,
    guard: Arc<StorageGuard>,
    source: Arc<dyn ArtifactSource>,
    tasks: DashMap<String, TaskHandle>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<DownloadEvent>,
    retry: RetryPolicy,
    progress_interval: Duration,
    speed_window: usize,
    read_timeout: Duration,
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        guard: Arc<StorageGuard>,
        source: Arc<dyn ArtifactSource>,
        config: &ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                catalog,
                guard,
                source,
                tasks: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
                events,
                retry: config.retry.clone(),
                progress_interval: config.progress_interval,
                speed_window: config.speed_window,
                read_timeout: config.read_timeout,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Start downloading `model_id`. Returns once the task is registered; the
    /// transfer runs in the background and reports through `subscribe`.
    pub async fn start(&self, model_id: &str) -> Result<(), ModelError> {
        let entry = self
            .inner
            .catalog
            .get(model_id)
            .await
            .ok_or_else(|| ModelError::ModelNotFound(model_id.to_string()))?;

        if self.inner.tasks.contains_key(model_id) {
            return Err(ModelError::AlreadyDownloading(model_id.to_string()));
        }
        if entry.is_downloaded {
            return Err(ModelError::AlreadyDownloaded(model_id.to_string()));
        }
        if self.inner.catalog.context_use(model_id).await.is_some() {
            return Err(ModelError::ContextBusy(format!("{} is the target of a context load", model_id)));
        }
        let remote = entry
            .remote_file_ref
            .clone()
            .ok_or_else(|| ModelError::NotDownloadable(model_id.to_string()))?;
        let dest = entry
            .download_destination(self.inner.catalog.models_dir())
            .ok_or_else(|| ModelError::NotDownloadable(model_id.to_string()))?;

        self.inner.guard.ensure_space(entry.size_bytes)?;

        let handle = match self.inner.tasks.entry(model_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(ModelError::AlreadyDownloading(model_id.to_string()));
            }
            Entry::Vacant(slot) => {
                let task = DownloadTask::new(model_id, dest.clone(), entry.size_bytes);
                let handle = TaskHandle {
                    task_id: task.task_id,
                    task: Arc::new(Mutex::new(task)),
                    dest_path: dest.clone(),
                    cancel: CancellationToken::new(),
                    finished: CancellationToken::new(),
                };
                slot.insert(handle.clone());
                handle
            }
        };

        log::info!("Starting download of {} to {:?}", model_id, dest);
        self.inner.publish(DownloadEvent::Started {
            model_id: model_id.to_string(),
            total_bytes: entry.size_bytes,
        });

        let inner = self.inner.clone();
        let model_id = model_id.to_string();
        tokio::spawn(async move {
            inner.run(model_id, handle, remote, entry.origin).await;
        });

        Ok(())
    }

    /// Cancel a download and wait until its partial file is gone.
    /// Unknown ids only clean up a stale partial file; finished tasks are left alone.
    pub async fn cancel(&self, model_id: &str) -> Result<(), ModelError> {
        let handle = self.inner.tasks.get(model_id).map(|h| h.clone());

        let Some(handle) = handle else {
            if let Some(dest) = self.destination_of(model_id).await {
                remove_if_exists(&part_path(&dest)).await?;
            }
            return Ok(());
        };

        {
            let mut task = handle.task.lock().await;
            if task.status.is_finished() {
                return Ok(());
            }
            task.status = DownloadStatus::Cancelling;
        }

        log::info!("Cancelling download of {}", model_id);
        handle.cancel.cancel();
        handle.finished.cancelled().await;
        Ok(())
    }

    /// Cancel every live download
    pub async fn cancel_all(&self) {
        let ids: Vec<String> = self.inner.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.cancel(&id).await {
                log::warn!("Failed to cancel download {}: {}", id, e);
            }
        }
    }

    pub fn is_downloading(&self, model_id: &str) -> bool {
        self.inner.tasks.contains_key(model_id)
    }

    /// Snapshot of the live task for `model_id`
    pub async fn progress(&self, model_id: &str) -> Option<DownloadTask> {
        let handle = self.inner.tasks.get(model_id).map(|h| h.clone())?;
        let task = handle.task.lock().await;
        Some(task.clone())
    }

    pub async fn tasks(&self) -> Vec<DownloadTask> {
        let handles: Vec<TaskHandle> = self.inner.tasks.iter().map(|e| e.value().clone()).collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.task.lock().await.clone());
        }
        tasks
    }

    /// Reconcile the catalog with the filesystem. Safe to call repeatedly.
    pub async fn refresh_download_statuses(&self) -> Result<RefreshReport, ModelError> {
        let mut report = RefreshReport::default();

        for entry in self.inner.catalog.list().await {
            if entry.is_downloaded {
                let present = match &entry.file_path {
                    Some(path) => tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false),
                    None => false,
                };
                if !present {
                    log::warn!("Model file for {} is missing, marking as not downloaded", entry.id);
                    self.inner
                        .catalog
                        .update_field(&entry.id, EntryPatch::not_downloaded(entry.origin))
                        .await?;
                    report.missing.push(ModelError::ArtifactMissing(entry.id.clone()));
                }
            } else if !self.is_downloading(&entry.id)
                && (entry.download_progress != 0.0 || entry.download_speed_bytes_per_sec != 0)
            {
                self.inner
                    .catalog
                    .update_field(&entry.id, EntryPatch::progress(0.0, 0))
                    .await?;
                report.reset_progress.push(entry.id.clone());
            }
        }

        let owned: HashSet<PathBuf> = self
            .inner
            .tasks
            .iter()
            .map(|e| part_path(&e.value().dest_path))
            .collect();
        for partial in find_partials(self.inner.catalog.models_dir()).await? {
            if !owned.contains(&partial) {
                remove_if_exists(&partial).await?;
                report.removed_partials.push(partial);
            }
        }

        if !report.is_empty() {
            log::info!(
                "Download status refresh: {} missing, {} reset, {} partial files removed",
                report.missing.len(),
                report.reset_progress.len(),
                report.removed_partials.len()
            );
        }
        Ok(report)
    }

    /// Delete a downloaded artifact. Imported local models are removed from the
    /// catalog as well, since nothing can download them again.
    pub async fn delete_artifact(&self, model_id: &str) -> Result<(), ModelError> {
        let entry = self
            .inner
            .catalog
            .get(model_id)
            .await
            .ok_or_else(|| ModelError::ModelNotFound(model_id.to_string()))?;

        if self.is_downloading(model_id) {
            return Err(ModelError::RemovalBlocked {
                model_id: model_id.to_string(),
                reason: "The model is still downloading. Cancel the download first.".to_string(),
            });
        }
        if let Some(reason) = self.inner.catalog.context_use(model_id).await {
            return Err(ModelError::RemovalBlocked {
                model_id: model_id.to_string(),
                reason: reason.to_string(),
            });
        }
        if !entry.is_downloaded {
            return Err(ModelError::ArtifactMissing(model_id.to_string()));
        }

        if let Some(path) = &entry.file_path {
            remove_if_exists(path).await?;
            if entry.origin != ModelOrigin::Local {
                if let Some(parent) = path.parent() {
                    // Only succeeds when the per-model directory is empty
                    let _ = tokio::fs::remove_dir(parent).await;
                }
            }
        }

        self.inner
            .catalog
            .update_field(model_id, EntryPatch::not_downloaded(entry.origin))
            .await?;
        if entry.origin == ModelOrigin::Local {
            self.inner.catalog.remove(model_id).await?;
        }

        log::info!("Deleted model file for {}", model_id);
        Ok(())
    }

    async fn destination_of(&self, model_id: &str) -> Option<PathBuf> {
        self.inner
            .catalog
            .get(model_id)
            .await
            .and_then(|e| e.download_destination(self.inner.catalog.models_dir()))
    }
}

impl Inner {
    fn publish(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    /// Worker body: runs the transfer, then cleans up and reports exactly once
    async fn run(&self, model_id: String, handle: TaskHandle, remote: RemoteFileRef, origin: ModelOrigin) {
        let _finished = handle.finished.clone().drop_guard();

        let outcome = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => Outcome::Cancelled,
            outcome = self.transfer(&model_id, &handle, &remote) => outcome,
        };

        let part = part_path(&handle.dest_path);
        match outcome {
            Outcome::Completed { path, size } => {
                if let Err(e) = self
                    .catalog
                    .update_field(&model_id, EntryPatch::downloaded(path.clone(), size))
                    .await
                {
                    log::error!("Download of {} finished but the catalog update failed: {}", model_id, e);
                }
                self.remove_task(&model_id, handle.task_id);
                log::info!("Download complete: {} ({} bytes)", model_id, size);
                self.publish(DownloadEvent::Completed { model_id, path });
            }
            Outcome::Cancelled => {
                if let Err(e) = remove_if_exists(&part).await {
                    log::warn!("Failed to remove partial file {:?}: {}", part, e);
                }
                self.reset_progress(&model_id).await;
                self.remove_task(&model_id, handle.task_id);
                log::info!("Download cancelled: {}", model_id);
                self.publish(DownloadEvent::Cancelled { model_id });
            }
            Outcome::Failed { reason, retryable } => {
                let error = ModelError::DownloadFailed {
                    model_id: model_id.clone(),
                    reason,
                    retryable,
                };
                self.fail(model_id, &handle, origin, error, retryable).await;
            }
            Outcome::Rejected(error) => {
                self.fail(model_id, &handle, origin, error, false).await;
            }
        }
    }

    /// Failure cleanup: drop the partial file, reset the entry, report once
    async fn fail(
        &self,
        model_id: String,
        handle: &TaskHandle,
        origin: ModelOrigin,
        error: ModelError,
        retryable: bool,
    ) {
        handle.task.lock().await.status = DownloadStatus::Failed;
        let part = part_path(&handle.dest_path);
        if let Err(e) = remove_if_exists(&part).await {
            log::warn!("Failed to remove partial file {:?}: {}", part, e);
        }
        let patch = EntryPatch::not_downloaded(origin);
        if let Err(e) = self.catalog.update_field(&model_id, patch).await {
            log::warn!("Failed to reset catalog entry {}: {}", model_id, e);
        }
        self.remove_task(&model_id, handle.task_id);
        log::error!("Download failed for {}: {}", model_id, error);
        self.publish(DownloadEvent::Failed {
            error,
            model_id,
            retryable,
        });
    }

    fn remove_task(&self, model_id: &str, task_id: Uuid) {
        self.tasks.remove_if(model_id, |_, h| h.task_id == task_id);
    }

    async fn reset_progress(&self, model_id: &str) {
        if let Err(e) = self.catalog.update_field(model_id, EntryPatch::progress(0.0, 0)).await {
            log::warn!("Failed to reset progress for {}: {}", model_id, e);
        }
    }

    async fn transfer(&self, model_id: &str, handle: &TaskHandle, remote: &RemoteFileRef) -> Outcome {
        let part = part_path(&handle.dest_path);
        if let Some(parent) = handle.dest_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Outcome::Failed {
                    reason: format!("Failed to create model directory: {}", e),
                    retryable: false,
                };
            }
        }

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Outcome::Failed {
                    reason: "Download queue closed".to_string(),
                    retryable: false,
                }
            }
        };
        {
            let mut task = handle.task.lock().await;
            if task.status == DownloadStatus::Cancelling {
                return Outcome::Cancelled;
            }
            task.status = DownloadStatus::Downloading;
        }

        let mut meter = SpeedMeter::new(self.speed_window);
        let mut published = 0u64;
        let mut failed_attempts = 0u32;

        let size = loop {
            match self
                .attempt(model_id, handle, remote, &part, &mut meter, &mut published)
                .await
            {
                Ok(size) => break size,
                Err(AttemptError::Cancelled) => return Outcome::Cancelled,
                Err(AttemptError::Rejected(error)) => return Outcome::Rejected(error),
                Err(AttemptError::Fatal(reason)) => {
                    return Outcome::Failed {
                        reason,
                        retryable: false,
                    }
                }
                Err(AttemptError::Transient(reason)) => {
                    failed_attempts += 1;
                    if failed_attempts >= self.retry.max_attempts {
                        return Outcome::Failed {
                            reason,
                            retryable: true,
                        };
                    }

                    let delay = self.retry.backoff_for(failed_attempts);
                    {
                        let mut task = handle.task.lock().await;
                        if task.status == DownloadStatus::Cancelling {
                            return Outcome::Cancelled;
                        }
                        task.retry_count = failed_attempts;
                        log::warn!(
                            "Download attempt {} for {} failed, retrying in {:?}: {}",
                            failed_attempts,
                            model_id,
                            delay,
                            reason
                        );
                        self.publish(DownloadEvent::Retrying {
                            model_id: model_id.to_string(),
                            attempt: failed_attempts,
                            delay_ms: delay.as_millis() as u64,
                            reason,
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if let Some(expected) = &remote.sha256 {
            match sha256_file(&part).await {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                Ok(actual) => {
                    return Outcome::Failed {
                        reason: format!("Checksum mismatch: expected {}, got {}", expected, actual),
                        retryable: true,
                    }
                }
                Err(e) => {
                    return Outcome::Failed {
                        reason: format!("Failed to verify download: {}", e),
                        retryable: false,
                    }
                }
            }
        }

        let mut task = handle.task.lock().await;
        if task.status == DownloadStatus::Cancelling {
            return Outcome::Cancelled;
        }
        if let Err(e) = tokio::fs::rename(&part, &handle.dest_path).await {
            return Outcome::Failed {
                reason: format!("Failed to move download into place: {}", e),
                retryable: false,
            };
        }
        task.status = DownloadStatus::Completed;
        task.bytes_downloaded = size;

        Outcome::Completed {
            path: handle.dest_path.clone(),
            size,
        }
    }

    /// One pass over the byte stream, appending to `part` when the source resumes
    async fn attempt(
        &self,
        model_id: &str,
        handle: &TaskHandle,
        remote: &RemoteFileRef,
        part: &Path,
        meter: &mut SpeedMeter,
        published: &mut u64,
    ) -> Result<u64, AttemptError> {
        let offset = tokio::fs::metadata(part).await.map(|m| m.len()).unwrap_or(0);
        let response = self.source.open(&remote.download_url, offset).await?;
        let resumes = response.resumed && offset > 0;

        // The catalog size may have been unknown or stale when `start` checked storage
        if let Some(total) = response.total_bytes {
            let budgeted = handle.task.lock().await.total_bytes;
            if total > budgeted {
                let remaining = total.saturating_sub(if resumes { offset } else { 0 });
                self.guard.ensure_space(remaining).map_err(AttemptError::Rejected)?;
            }
        }

        let (mut file, mut written) = if resumes {
            log::info!("Resuming download of {} at byte {}", model_id, offset);
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(part)
                .await
                .map_err(write_error)?;
            (file, offset)
        } else {
            (tokio::fs::File::create(part).await.map_err(write_error)?, 0)
        };

        let total = {
            let mut task = handle.task.lock().await;
            if let Some(total) = response.total_bytes {
                task.total_bytes = total;
            }
            task.total_bytes
        };

        let mut stream = response.stream;
        let mut tick = Instant::now();
        let mut bytes_at_tick = written;

        let streamed: Result<(), AttemptError> = async {
            loop {
                let next = tokio::time::timeout(self.read_timeout, stream.next())
                    .await
                    .map_err(|_| {
                        AttemptError::Transient(format!("No data received for {:?}", self.read_timeout))
                    })?;

                match next {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(chunk)) => {
                        file.write_all(&chunk).await.map_err(write_error)?;
                        written += chunk.len() as u64;
                    }
                }

                let elapsed = tick.elapsed();
                if elapsed >= self.progress_interval {
                    let speed = meter.record(written.saturating_sub(bytes_at_tick), elapsed);
                    self.publish_progress(model_id, handle, written, total, speed, published)
                        .await?;
                    tick = Instant::now();
                    bytes_at_tick = written;
                }
            }
        }
        .await;

        // Flush even on failure so a resumed attempt sees every written byte
        let flushed = file.flush().await;
        streamed?;
        flushed.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        if total > 0 && written < total {
            return Err(AttemptError::Transient(format!(
                "Connection closed after {} of {} bytes",
                written, total
            )));
        }

        Ok(written)
    }

    /// Publish progress unless the task is being cancelled. The status check, the
    /// event and the catalog update all happen under the task lock.
    async fn publish_progress(
        &self,
        model_id: &str,
        handle: &TaskHandle,
        written: u64,
        total: u64,
        speed: u64,
        published: &mut u64,
    ) -> Result<(), AttemptError> {
        let mut task = handle.task.lock().await;
        if task.status == DownloadStatus::Cancelling {
            return Err(AttemptError::Cancelled);
        }

        // A restarted transfer must not move progress backwards
        let bytes = written.max(*published);
        *published = bytes;
        task.bytes_downloaded = bytes;
        let progress = task.progress();

        self.publish(DownloadEvent::Progress(DownloadProgress {
            model_id: model_id.to_string(),
            bytes_downloaded: bytes,
            total_bytes: total,
            progress,
            speed_bytes_per_sec: speed,
        }));
        if let Err(e) = self
            .catalog
            .update_field(model_id, EntryPatch::progress(progress, speed))
            .await
        {
            log::warn!("Failed to record progress for {}: {}", model_id, e);
        }
        Ok(())
    }
}

fn write_error(e: io::Error) -> AttemptError {
    AttemptError::Fatal(format!("Failed to write model file: {}", e))
}

async fn remove_if_exists(path: &Path) -> Result<(), ModelError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `*.part` files directly inside the per-model directories under `models_dir`
async fn find_partials(models_dir: &Path) -> Result<Vec<PathBuf>, ModelError> {
    let mut found = Vec::new();
    let mut dirs = match tokio::fs::read_dir(models_dir).await {
        Ok(dirs) => dirs,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };

    while let Some(dir) = dirs.next_entry().await? {
        if !dir.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PART_EXTENSION) {
                found.push(path);
            }
        }
    }
    Ok(found)
}

async fn sha256_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use tempfile::{tempdir, TempDir};

    use crate::catalog::ModelEntry;
    use crate::database::DatabaseManager;
    use crate::download::transfer::TransferResponse;
    use crate::storage::FixedDiskSpace;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// In-memory artifact served in fixed-size chunks
    struct MemorySource {
        data: Vec<u8>,
        chunk: usize,
        chunk_delay: Duration,
        honor_range: bool,
        /// Fail this many `open` calls before serving anything
        failing_opens: AtomicU32,
        /// Break the stream once after this many bytes
        break_after: Option<usize>,
        broke: AtomicBool,
        fatal: bool,
        opens: AtomicU32,
    }

    impl MemorySource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                chunk: 4,
                chunk_delay: Duration::ZERO,
                honor_range: true,
                failing_opens: AtomicU32::new(0),
                break_after: None,
                broke: AtomicBool::new(false),
                fatal: false,
                opens: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ArtifactSource for MemorySource {
        async fn open(&self, _url: &str, offset: u64) -> Result<TransferResponse, TransferError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(TransferError::Fatal("Download failed with status: 404".to_string()));
            }
            if self
                .failing_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransferError::Transient("connection reset".to_string()));
            }

            let resumed = self.honor_range && offset > 0;
            let start = if resumed { offset as usize } else { 0 };
            let mut body: Vec<u8> = self.data[start..].to_vec();
            let mut tail_error = None;
            if let Some(limit) = self.break_after {
                if !self.broke.swap(true, Ordering::SeqCst) {
                    body.truncate(limit);
                    tail_error = Some(TransferError::Transient("stream broke".to_string()));
                }
            }

            let delay = self.chunk_delay;
            let mut items: Vec<Result<Bytes, TransferError>> = body
                .chunks(self.chunk)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            if let Some(err) = tail_error {
                items.push(Err(err));
            }
            let stream = stream::iter(items)
                .then(move |item| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    item
                })
                .boxed();

            Ok(TransferResponse {
                total_bytes: Some(self.data.len() as u64),
                resumed,
                stream,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        models_dir: PathBuf,
        catalog: Arc<ModelCatalog>,
        coordinator: DownloadCoordinator,
        source: Arc<MemorySource>,
    }

    async fn fixture(source: MemorySource, available: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let mut config = ManagerConfig::with_storage_root(dir.path().to_path_buf());
        config.progress_interval = Duration::ZERO;
        config.storage_margin_bytes = 0;
        config.read_timeout = Duration::from_secs(5);
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };

        let db = Arc::new(DatabaseManager::in_memory().unwrap());
        let catalog = Arc::new(ModelCatalog::new(db, config.models_dir()));
        let guard = Arc::new(StorageGuard::new(
            Arc::new(FixedDiskSpace { available, total: available }),
            config.storage_margin_bytes,
        ));
        let source = Arc::new(source);
        let coordinator = DownloadCoordinator::new(catalog.clone(), guard, source.clone(), &config);

        Fixture {
            models_dir: config.models_dir(),
            _dir: dir,
            catalog,
            coordinator,
            source,
        }
    }

    async fn add_remote(catalog: &ModelCatalog, size: u64) -> ModelEntry {
        let entry = ModelEntry::remote(
            RemoteFileRef::huggingface("https://huggingface.co", "org/repo", "model-Q4.gguf"),
            size,
        );
        catalog.add(entry.clone()).await.unwrap();
        entry
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Collect events for `model_id` until a terminal one arrives
    async fn collect_until_done(rx: &mut broadcast::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for download event")
                .unwrap();
            let done = matches!(
                event,
                DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. } | DownloadEvent::Cancelled { .. }
            );
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_download_completes() {
        let payload = data(64);
        let f = fixture(MemorySource::new(payload.clone()), GIB).await;
        let entry = add_remote(&f.catalog, 64).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        assert!(matches!(events.first(), Some(DownloadEvent::Started { .. })));
        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert_eq!(
            events.last(),
            Some(&DownloadEvent::Completed {
                model_id: entry.id.clone(),
                path: dest.clone(),
            })
        );

        let mut last = 0;
        for event in &events {
            if let DownloadEvent::Progress(p) = event {
                assert!(p.bytes_downloaded >= last);
                last = p.bytes_downloaded;
            }
        }

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        assert!(!part_path(&dest).exists());
        let stored = f.catalog.get(&entry.id).await.unwrap();
        assert!(stored.is_downloaded);
        assert_eq!(stored.file_path, Some(dest));
        assert_eq!(stored.download_progress, 1.0);
        assert!(!f.coordinator.is_downloading(&entry.id));
    }

    #[tokio::test]
    async fn test_concurrent_start_creates_one_task() {
        let mut source = MemorySource::new(data(64));
        source.chunk_delay = Duration::from_millis(20);
        let f = fixture(source, GIB).await;
        let entry = add_remote(&f.catalog, 64).await;

        let (a, b) = tokio::join!(f.coordinator.start(&entry.id), f.coordinator.start(&entry.id));
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ModelError::AlreadyDownloading(_)))));
        assert_eq!(f.coordinator.tasks().await.len(), 1);

        f.coordinator.cancel(&entry.id).await.unwrap();
        assert!(f.source.opens.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_insufficient_storage_creates_nothing() {
        let f = fixture(MemorySource::new(data(8)), GIB + GIB / 2).await;
        let entry = add_remote(&f.catalog, 2 * GIB).await;

        let err = f.coordinator.start(&entry.id).await.unwrap_err();
        assert!(matches!(err, ModelError::InsufficientStorage { .. }));
        assert!(f.coordinator.tasks().await.is_empty());

        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert!(!part_path(&dest).exists());
        assert!(!dest.parent().unwrap().exists());
        assert_eq!(f.source.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_partial_file() {
        let mut source = MemorySource::new(data(4_000));
        source.chunk_delay = Duration::from_millis(5);
        let f = fixture(source, GIB).await;
        let entry = add_remote(&f.catalog, 4_000).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        loop {
            if let DownloadEvent::Progress(_) = rx.recv().await.unwrap() {
                break;
            }
        }
        f.coordinator.cancel(&entry.id).await.unwrap();

        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert!(!part_path(&dest).exists());
        assert!(!dest.exists());
        assert!(!f.coordinator.is_downloading(&entry.id));
        let stored = f.catalog.get(&entry.id).await.unwrap();
        assert!(!stored.is_downloaded);
        assert_eq!(stored.download_progress, 0.0);

        let rest = collect_until_done(&mut rx).await;
        assert_eq!(
            rest.last(),
            Some(&DownloadEvent::Cancelled { model_id: entry.id.clone() })
        );
        // Nothing after the acknowledgment
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_removes_stale_partial() {
        let f = fixture(MemorySource::new(data(8)), GIB).await;
        let entry = add_remote(&f.catalog, 8).await;
        let dest = entry.download_destination(&f.models_dir).unwrap();
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(part_path(&dest), b"stale").unwrap();

        f.coordinator.cancel(&entry.id).await.unwrap();
        assert!(!part_path(&dest).exists());
        f.coordinator.cancel("never-heard-of-it").await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_resumes() {
        let payload = data(100);
        let mut source = MemorySource::new(payload.clone());
        source.break_after = Some(40);
        let f = fixture(source, GIB).await;
        let entry = add_remote(&f.catalog, 100).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, DownloadEvent::Retrying { attempt: 1, .. })));
        assert!(matches!(events.last(), Some(DownloadEvent::Completed { .. })));
        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), payload);
        assert_eq!(f.source.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restart_without_range_keeps_progress_monotonic() {
        let payload = data(100);
        let mut source = MemorySource::new(payload.clone());
        source.break_after = Some(60);
        source.honor_range = false;
        let f = fixture(source, GIB).await;
        let entry = add_remote(&f.catalog, 100).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        let mut last = 0;
        for event in &events {
            if let DownloadEvent::Progress(p) = event {
                assert!(p.bytes_downloaded >= last, "progress went backwards");
                last = p.bytes_downloaded;
            }
        }
        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let source = MemorySource::new(data(16));
        source.failing_opens.store(10, Ordering::SeqCst);
        let f = fixture(source, GIB).await;
        let entry = add_remote(&f.catalog, 16).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        match events.last() {
            Some(DownloadEvent::Failed { error, retryable, .. }) => {
                assert!(*retryable);
                assert!(error.is_retryable());
            }
            other => panic!("unexpected final event {:?}", other),
        }
        assert_eq!(f.source.opens.load(Ordering::SeqCst), 3);
        let stored = f.catalog.get(&entry.id).await.unwrap();
        assert!(!stored.is_downloaded);
        assert_eq!(stored.download_progress, 0.0);
        assert!(!f.coordinator.is_downloading(&entry.id));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let mut source = MemorySource::new(data(16));
        source.fatal = true;
        let f = fixture(source, GIB).await;
        let entry = add_remote(&f.catalog, 16).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        assert!(matches!(
            events.last(),
            Some(DownloadEvent::Failed { retryable: false, .. })
        ));
        assert_eq!(f.source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let f = fixture(MemorySource::new(data(16)), GIB).await;
        let mut remote = RemoteFileRef::huggingface("https://huggingface.co", "org/repo", "sum.gguf");
        remote.sha256 = Some("00".repeat(32));
        let entry = ModelEntry::remote(remote, 16);
        f.catalog.add(entry.clone()).await.unwrap();
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        assert!(matches!(events.last(), Some(DownloadEvent::Failed { .. })));
        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let f = fixture(MemorySource::new(data(8)), GIB).await;
        assert!(matches!(
            f.coordinator.start("missing").await,
            Err(ModelError::ModelNotFound(_))
        ));

        let local = ModelEntry::local(f.models_dir.join("local/a.gguf"), 8);
        f.catalog.add(local.clone()).await.unwrap();
        assert!(matches!(
            f.coordinator.start(&local.id).await,
            Err(ModelError::AlreadyDownloaded(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_after_external_deletion() {
        let f = fixture(MemorySource::new(data(32)), GIB).await;
        let entry = add_remote(&f.catalog, 32).await;
        let mut rx = f.coordinator.subscribe();
        f.coordinator.start(&entry.id).await.unwrap();
        collect_until_done(&mut rx).await;

        let dest = entry.download_destination(&f.models_dir).unwrap();
        std::fs::remove_file(&dest).unwrap();
        let orphan = f.models_dir.join("other").join("x.gguf.part");
        std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        std::fs::write(&orphan, b"x").unwrap();

        let report = f.coordinator.refresh_download_statuses().await.unwrap();
        assert_eq!(report.missing, vec![ModelError::ArtifactMissing(entry.id.clone())]);
        assert_eq!(report.removed_partials, vec![orphan.clone()]);
        assert!(!orphan.exists());

        let stored = f.catalog.get(&entry.id).await.unwrap();
        assert!(!stored.is_downloaded);
        assert_eq!(stored.file_path, None);

        let again = f.coordinator.refresh_download_statuses().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_local_path() {
        let f = fixture(MemorySource::new(data(8)), GIB).await;
        let local = ModelEntry::local(f.models_dir.join("local/gone.gguf"), 8);
        f.catalog.add(local.clone()).await.unwrap();

        let report = f.coordinator.refresh_download_statuses().await.unwrap();
        assert_eq!(report.missing.len(), 1);
        let stored = f.catalog.get(&local.id).await.unwrap();
        assert!(!stored.is_downloaded);
        assert_eq!(stored.file_path, local.file_path);
    }

    #[tokio::test]
    async fn test_unknown_size_is_checked_once_reported() {
        let f = fixture(MemorySource::new(data(4_000)), 100).await;
        let entry = add_remote(&f.catalog, 0).await;
        let mut rx = f.coordinator.subscribe();

        f.coordinator.start(&entry.id).await.unwrap();
        let events = collect_until_done(&mut rx).await;

        match events.last() {
            Some(DownloadEvent::Failed { error, retryable, .. }) => {
                assert_eq!(
                    *error,
                    ModelError::InsufficientStorage {
                        required_bytes: 4_000,
                        available_bytes: 100,
                    }
                );
                assert!(!retryable);
            }
            other => panic!("expected a storage failure, got {:?}", other),
        }
        assert!(!events.iter().any(|e| matches!(e, DownloadEvent::Progress(_))));

        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        assert!(!f.catalog.get(&entry.id).await.unwrap().is_downloaded);
        assert!(f.coordinator.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_loading_target_is_not_deleted_or_downloaded() {
        let f = fixture(MemorySource::new(data(32)), GIB).await;
        let entry = add_remote(&f.catalog, 32).await;

        f.catalog.set_loading_model(Some(entry.id.clone())).await;
        assert!(matches!(
            f.coordinator.start(&entry.id).await,
            Err(ModelError::ContextBusy(_))
        ));
        f.catalog.set_loading_model(None).await;

        let mut rx = f.coordinator.subscribe();
        f.coordinator.start(&entry.id).await.unwrap();
        collect_until_done(&mut rx).await;

        f.catalog.set_loading_model(Some(entry.id.clone())).await;
        assert!(matches!(
            f.coordinator.delete_artifact(&entry.id).await,
            Err(ModelError::RemovalBlocked { .. })
        ));
        assert!(entry.download_destination(&f.models_dir).unwrap().exists());
    }

    #[tokio::test]
    async fn test_delete_artifact() {
        let f = fixture(MemorySource::new(data(32)), GIB).await;
        let entry = add_remote(&f.catalog, 32).await;
        let mut rx = f.coordinator.subscribe();
        f.coordinator.start(&entry.id).await.unwrap();
        collect_until_done(&mut rx).await;

        f.catalog.set_active_model(Some(entry.id.clone())).await;
        assert!(matches!(
            f.coordinator.delete_artifact(&entry.id).await,
            Err(ModelError::RemovalBlocked { .. })
        ));
        f.catalog.set_active_model(None).await;

        f.coordinator.delete_artifact(&entry.id).await.unwrap();
        let dest = entry.download_destination(&f.models_dir).unwrap();
        assert!(!dest.exists());
        let stored = f.catalog.get(&entry.id).await.unwrap();
        assert!(!stored.is_downloaded);
        assert!(stored.file_path.is_none());

        // Not downloaded any more, so it can be removed from the catalog
        f.catalog.remove(&entry.id).await.unwrap();
    }
}
