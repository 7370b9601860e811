// Service wiring for the model manager
//
// Builds every component once, in dependency order, and hands out shared handles.

use std::path::Path;
use std::sync::Arc;

use crate::catalog::{import_local, ModelCatalog, ModelEntry};
use crate::config::ManagerConfig;
use crate::context::{ContextLifecycleManager, ContextState, InferenceRuntime};
use crate::database::DatabaseManager;
use crate::download::{ArtifactSource, DownloadCoordinator, HttpArtifactSource};
use crate::error::ModelError;
use crate::hub::{CatalogBridge, HfCatalogClient, RemoteCatalog};
use crate::settings::SettingsOverlay;
use crate::storage::{DiskSpaceProvider, StorageGuard, SysinfoDiskSpace};

/// Collaborators the host platform provides
pub struct Collaborators {
    pub disk_space: Arc<dyn DiskSpaceProvider>,
    pub runtime: Arc<dyn InferenceRuntime>,
    pub source: Arc<dyn ArtifactSource>,
    pub remote: Arc<dyn RemoteCatalog>,
}

pub struct ModelServices {
    config: ManagerConfig,
    db: Arc<DatabaseManager>,
    pub catalog: Arc<ModelCatalog>,
    pub guard: Arc<StorageGuard>,
    pub downloads: DownloadCoordinator,
    pub context: ContextLifecycleManager,
    pub overlay: SettingsOverlay,
    pub bridge: CatalogBridge,
}

impl ModelServices {
    /// Open the store, restore the catalog and reconcile it with the filesystem
    pub async fn new(config: ManagerConfig, collaborators: Collaborators) -> Result<Self, ModelError> {
        let db = Arc::new(DatabaseManager::new(config.db_path.clone())?);
        Self::with_database(config, db, collaborators).await
    }

    /// Production wiring: sysinfo storage query, HTTP downloads and the Hugging Face API
    pub async fn with_runtime(
        config: ManagerConfig,
        runtime: Arc<dyn InferenceRuntime>,
    ) -> Result<Self, ModelError> {
        tokio::fs::create_dir_all(config.models_dir()).await?;
        let collaborators = Collaborators {
            disk_space: Arc::new(SysinfoDiskSpace::new(config.storage_root.clone())),
            runtime,
            source: Arc::new(HttpArtifactSource::new(config.connect_timeout)?),
            remote: Arc::new(HfCatalogClient::new(&config.hub_base_url, config.read_timeout)?),
        };
        Self::new(config, collaborators).await
    }

    pub async fn with_database(
        config: ManagerConfig,
        db: Arc<DatabaseManager>,
        collaborators: Collaborators,
    ) -> Result<Self, ModelError> {
        let settings = db.load_manager_settings()?;
        log::info!(
            "Manager settings: auto_release={}, acceleration={}, n_context={}, n_gpu_layers={}",
            settings.use_auto_release,
            settings.use_acceleration,
            settings.n_context,
            settings.n_gpu_layers
        );

        let catalog = Arc::new(ModelCatalog::new(db.clone(), config.models_dir()));
        catalog.load_from_store().await?;

        let guard = Arc::new(StorageGuard::new(
            collaborators.disk_space,
            config.storage_margin_bytes,
        ));
        let downloads = DownloadCoordinator::new(
            catalog.clone(),
            guard.clone(),
            collaborators.source,
            &config,
        );
        let context = ContextLifecycleManager::new(
            collaborators.runtime,
            catalog.clone(),
            downloads.clone(),
            db.clone(),
            settings,
        );
        let overlay = SettingsOverlay::new(catalog.clone());
        let bridge = CatalogBridge::new(
            collaborators.remote,
            catalog.clone(),
            guard.clone(),
            &config.hub_base_url,
        );

        downloads.refresh_download_statuses().await?;

        Ok(Self {
            config,
            db,
            catalog,
            guard,
            downloads,
            context,
            overlay,
            bridge,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn database(&self) -> Arc<DatabaseManager> {
        self.db.clone()
    }

    /// Copy a user-picked file into `<storage>/models/local` and register it
    pub async fn import_local(&self, source: &Path) -> Result<ModelEntry, ModelError> {
        import_local(&self.catalog, &self.guard, source, &self.config.local_models_dir()).await
    }

    /// Remove a catalog entry that has no artifact on disk
    pub async fn remove_model(&self, model_id: &str) -> Result<(), ModelError> {
        if self.downloads.is_downloading(model_id) {
            return Err(ModelError::RemovalBlocked {
                model_id: model_id.to_string(),
                reason: "The model is still downloading. Cancel the download first.".to_string(),
            });
        }
        self.catalog.remove(model_id).await
    }

    /// Clear every override and restore the bundled presets; downloads are kept
    pub async fn reset_models(&self) -> Result<(), ModelError> {
        self.overlay.reset_all().await
    }

    /// Stop all transfers and release the loaded context. A load that is in
    /// flight is allowed to finish and is then released.
    pub async fn shutdown(&self) {
        log::info!("Shutting down model services");
        self.downloads.cancel_all().await;
        loop {
            if self.context.settle().await == ContextState::Unloaded {
                break;
            }
            match self.context.manual_release_context().await {
                Err(ModelError::ContextBusy(reason)) => {
                    log::debug!("Context still busy during shutdown: {}", reason);
                }
                Err(e) => {
                    log::warn!("Failed to release context during shutdown: {}", e);
                    break;
                }
                Ok(()) => break,
            }
        }
    }
}
