// End-to-end tests of the wired model services with in-process collaborators

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tempfile::tempdir;
use tokio::sync::Notify;

use pocketpal_core::context::{NativeHandle, RuntimeError};
use pocketpal_core::download::{ArtifactSource, TransferError, TransferResponse};
use pocketpal_core::hub::{FileDetails, HfModel, ModelFile, RemoteCatalog};
use pocketpal_core::settings::CompletionSettingsPatch;
use pocketpal_core::storage::FixedDiskSpace;
use pocketpal_core::{
    Collaborators, ContextParams, ContextState, DownloadEvent, InferenceRuntime, ManagerConfig, ModelError,
    ModelOrigin, ModelServices, SearchPage, SearchQuery,
};

const REPO: &str = "bartowski/SmolLM2-135M-Instruct-GGUF";
const FILE: &str = "SmolLM2-135M-Instruct-Q8_0.gguf";

struct BytesSource(Vec<u8>);

#[async_trait]
impl ArtifactSource for BytesSource {
    async fn open(&self, _url: &str, offset: u64) -> Result<TransferResponse, TransferError> {
        let rest = self.0[offset as usize..].to_vec();
        let chunks: Vec<Result<Bytes, TransferError>> =
            rest.chunks(64).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        Ok(TransferResponse {
            total_bytes: Some(self.0.len() as u64),
            resumed: offset > 0,
            stream: stream::iter(chunks).boxed(),
        })
    }
}

#[derive(Default)]
struct RecordingRuntime {
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl InferenceRuntime for RecordingRuntime {
    async fn load(&self, model_path: &Path, params: ContextParams) -> Result<NativeHandle, RuntimeError> {
        let name = model_path.file_name().unwrap().to_string_lossy().to_string();
        self.calls.lock().unwrap().push(format!("load {} n_ctx={}", name, params.n_context));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(NativeHandle(name))
    }

    async fn release(&self, handle: NativeHandle) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().push(format!("release {}", handle.0));
        Ok(())
    }
}

struct OneRepoRemote;

fn smol_repo() -> HfModel {
    HfModel {
        id: REPO.to_string(),
        author: Some("bartowski".to_string()),
        downloads: 1,
        likes: 0,
        tags: vec!["gguf".to_string()],
        last_modified: None,
        siblings: vec![
            ModelFile {
                rfilename: FILE.to_string(),
                ..Default::default()
            },
            ModelFile {
                rfilename: "config.json".to_string(),
                ..Default::default()
            },
        ],
        url: String::new(),
    }
}

#[async_trait]
impl RemoteCatalog for OneRepoRemote {
    async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, ModelError> {
        Ok(SearchPage {
            models: vec![smol_repo()],
            next_page: None,
        })
    }

    async fn next_page(&self, _token: &str) -> Result<SearchPage, ModelError> {
        Ok(SearchPage::default())
    }

    async fn file_details(&self, _repo_id: &str) -> Result<Vec<FileDetails>, ModelError> {
        Ok(vec![FileDetails {
            filename: FILE.to_string(),
            size: 1_000,
            sha256: None,
        }])
    }
}

fn config(root: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::with_storage_root(root.to_path_buf());
    config.storage_margin_bytes = 0;
    config.progress_interval = Duration::from_millis(1);
    config.retry.initial_backoff = Duration::from_millis(1);
    config
}

async fn services(root: &Path, runtime: Arc<RecordingRuntime>) -> ModelServices {
    let collaborators = Collaborators {
        disk_space: Arc::new(FixedDiskSpace {
            available: 1_000_000,
            total: 4_000_000,
        }),
        runtime,
        source: Arc::new(BytesSource(vec![7u8; 1_000])),
        remote: Arc::new(OneRepoRemote),
    };
    ModelServices::new(config(root), collaborators).await.unwrap()
}

async fn wait_for_completion(services: &ModelServices, model_id: &str) {
    let mut events = services.downloads.subscribe();
    services.downloads.start(model_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                DownloadEvent::Completed { model_id: id, .. } if id == model_id => break,
                DownloadEvent::Failed { error, .. } => panic!("download failed: {}", error),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_search_bookmark_download_and_load() {
    let dir = tempdir().unwrap();
    let runtime = Arc::new(RecordingRuntime::default());
    let services = services(dir.path(), runtime.clone()).await;

    let page = services.bridge.search(&SearchQuery::text("smol")).await.unwrap();
    let repo = &page.models[0];
    assert_eq!(repo.siblings.len(), 1);

    let entry = services.bridge.bookmark(repo, &repo.siblings[0]).await.unwrap();
    assert_eq!(entry.origin, ModelOrigin::Remote);
    assert_eq!(entry.size_bytes, 1_000);

    wait_for_completion(&services, &entry.id).await;
    let downloaded = services.catalog.get(&entry.id).await.unwrap();
    assert!(downloaded.is_downloaded);
    assert_eq!(downloaded.download_progress, 1.0);
    let path = downloaded.file_path.clone().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_000);

    let active = services.context.init_context(&entry.id).await.unwrap();
    assert_eq!(active.model_id, entry.id);
    assert_eq!(services.context.state().await, ContextState::Loaded);
    assert_eq!(services.catalog.active_model_id().await, Some(entry.id.clone()));

    let err = services.downloads.delete_artifact(&entry.id).await.unwrap_err();
    assert!(matches!(err, ModelError::RemovalBlocked { .. }));

    services.shutdown().await;
    assert_eq!(services.context.state().await, ContextState::Unloaded);
    services.downloads.delete_artifact(&entry.id).await.unwrap();
    assert!(!path.exists());
    services.remove_model(&entry.id).await.unwrap();
    assert!(!services.bridge.is_bookmarked(REPO, FILE).await);

    let calls = runtime.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![format!("load {} n_ctx=1024", FILE), format!("release {}", FILE)]);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("my-phi-3.gguf");
    std::fs::write(&source, vec![1u8; 256]).unwrap();

    let model_id = {
        let services = services(dir.path(), Arc::new(RecordingRuntime::default())).await;
        let entry = services.import_local(&source).await.unwrap();
        services
            .overlay
            .update_completion_settings(
                &entry.id,
                CompletionSettingsPatch {
                    temperature: Some(0.2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        services.context.set_n_context(2048).await.unwrap();
        entry.id
    };

    let runtime = Arc::new(RecordingRuntime::default());
    let services = services(dir.path(), runtime.clone()).await;

    let entry = services.catalog.get(&model_id).await.unwrap();
    assert!(entry.is_downloaded);
    assert_eq!(entry.completion_settings_override.temperature, Some(0.2));
    assert_eq!(services.context.settings().await.n_context, 2048);

    services.context.init_context(&model_id).await.unwrap();
    assert_eq!(
        runtime.calls.lock().unwrap().clone(),
        vec!["load my-phi-3.gguf n_ctx=2048".to_string()]
    );

    // Reset clears overrides but keeps the imported file
    services.context.manual_release_context().await.unwrap();
    services.reset_models().await.unwrap();
    let entry = services.catalog.get(&model_id).await.unwrap();
    assert!(entry.is_downloaded);
    assert!(entry.completion_settings_override.is_empty());
}

#[tokio::test]
async fn test_missing_artifact_is_reconciled_on_start() {
    let dir = tempdir().unwrap();

    let (model_id, path) = {
        let services = services(dir.path(), Arc::new(RecordingRuntime::default())).await;
        let page = services.bridge.search(&SearchQuery::default()).await.unwrap();
        let repo = &page.models[0];
        let entry = services.bridge.bookmark(repo, &repo.siblings[0]).await.unwrap();
        wait_for_completion(&services, &entry.id).await;
        let path = services.catalog.get(&entry.id).await.unwrap().file_path.unwrap();
        (entry.id, path)
    };

    std::fs::remove_file(&path).unwrap();

    let services = services(dir.path(), Arc::new(RecordingRuntime::default())).await;
    let entry = services.catalog.get(&model_id).await.unwrap();
    assert!(!entry.is_downloaded);
    assert_eq!(entry.file_path, None);

    let err = services.context.init_context(&model_id).await.unwrap_err();
    assert!(matches!(err, ModelError::ArtifactMissing(_)));
}

#[tokio::test]
async fn test_shutdown_releases_a_load_in_flight() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("tiny.gguf");
    std::fs::write(&source, vec![3u8; 128]).unwrap();

    let gate = Arc::new(Notify::new());
    let runtime = Arc::new(RecordingRuntime {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let services = services(dir.path(), runtime.clone()).await;
    let entry = services.import_local(&source).await.unwrap();

    let mut events = services.context.subscribe();
    let context = services.context.clone();
    let model_id = entry.id.clone();
    let loading = tokio::spawn(async move { context.init_context(&model_id).await });
    assert_eq!(events.recv().await.unwrap().state, ContextState::Loading);

    tokio::join!(services.shutdown(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
    });

    loading.await.unwrap().unwrap();
    assert_eq!(services.context.state().await, ContextState::Unloaded);
    assert_eq!(services.catalog.active_model_id().await, None);
    assert_eq!(
        runtime.calls.lock().unwrap().clone(),
        vec!["load tiny.gguf n_ctx=1024".to_string(), "release tiny.gguf".to_string()]
    );
}
