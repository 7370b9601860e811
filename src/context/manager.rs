//! Context lifecycle manager
//!
//! The device can hold one native inference context. This manager owns it and
//! runs a small state machine under a mutex:
//!
//! ```text
//! Unloaded -> Loading -> Loaded -> Unloading -> Unloaded
//!                 \-> Unloaded (load failed)
//! ```
//!
//! Requests that arrive while Loading or Unloading get `ContextBusy`. Switching
//! models releases the old context completely before the new load starts. Every
//! transition runs in a spawned task, so a caller that stops waiting cannot leave
//! the machine half way through an offload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::catalog::{EntryPatch, ModelCatalog};
use crate::database::{
    settings_repo::{KEY_N_CONTEXT, KEY_N_GPU_LAYERS, KEY_USE_ACCELERATION, KEY_USE_AUTO_RELEASE},
    DatabaseManager, ManagerSettings, MAX_GPU_LAYERS, MIN_CONTEXT_SIZE, MIN_GPU_LAYERS,
};
use crate::download::DownloadCoordinator;
use crate::error::ModelError;

use super::runtime::{ContextParams, InferenceRuntime, NativeHandle};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// A state transition for `model_id`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextEvent {
    pub model_id: String,
    pub state: ContextState,
}

/// Signals from the host operating system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostSignal {
    MemoryPressure,
    Backgrounded,
    Foregrounded,
}

/// The loaded context
#[derive(Debug, Clone, Serialize)]
pub struct ActiveContext {
    pub model_id: String,
    #[serde(skip)]
    handle: NativeHandle,
    pub params: ContextParams,
    pub model_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

struct Machine {
    state: ContextState,
    active: Option<ActiveContext>,
    /// Model released by auto-release on backgrounding, reloaded on foregrounding
    released_on_background: Option<String>,
}

struct Inner {
    machine: Mutex<Machine>,
    runtime: Arc<dyn InferenceRuntime>,
    catalog: Arc<ModelCatalog>,
    downloads: DownloadCoordinator,
    db: Arc<DatabaseManager>,
    settings: RwLock<ManagerSettings>,
    events: broadcast::Sender<ContextEvent>,
}

#[derive(Clone)]
pub struct ContextLifecycleManager {
    inner: Arc<Inner>,
}

impl ContextLifecycleManager {
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        catalog: Arc<ModelCatalog>,
        downloads: DownloadCoordinator,
        db: Arc<DatabaseManager>,
        settings: ManagerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(Machine {
                    state: ContextState::Unloaded,
                    active: None,
                    released_on_background: None,
                }),
                runtime,
                catalog,
                downloads,
                db,
                settings: RwLock::new(settings),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> ContextState {
        self.inner.machine.lock().await.state
    }

    pub async fn active_context(&self) -> Option<ActiveContext> {
        self.inner.machine.lock().await.active.clone()
    }

    /// Wait until no load or release is in flight and return the state it settled in
    pub async fn settle(&self) -> ContextState {
        let mut events = self.subscribe();
        loop {
            let state = self.state().await;
            if matches!(state, ContextState::Loaded | ContextState::Unloaded) {
                return state;
            }
            // Re-check on each transition, and periodically in case one went unannounced
            let _ = tokio::time::timeout(SETTLE_POLL_INTERVAL, events.recv()).await;
        }
    }

    /// Load `model_id`, releasing whatever is loaded first
    pub async fn init_context(&self, model_id: &str) -> Result<ActiveContext, ModelError> {
        let inner = self.inner.clone();
        let model_id = model_id.to_string();
        tokio::spawn(async move { inner.init_context(&model_id).await })
            .await
            .map_err(|e| ModelError::ContextBusy(format!("Context transition aborted: {}", e)))?
    }

    /// Release the loaded context, if any
    pub async fn manual_release_context(&self) -> Result<(), ModelError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.release_context().await.map(|_| ()) })
            .await
            .map_err(|e| ModelError::ContextBusy(format!("Context transition aborted: {}", e)))?
    }

    /// Apply the auto-release policy to a host signal
    pub async fn on_host_signal(&self, signal: HostSignal) -> Result<(), ModelError> {
        let auto_release = self.inner.settings.read().await.use_auto_release;
        log::debug!("Host signal {:?} (auto-release: {})", signal, auto_release);

        match signal {
            HostSignal::MemoryPressure | HostSignal::Backgrounded => {
                if !auto_release {
                    return Ok(());
                }
                let inner = self.inner.clone();
                let released = tokio::spawn(async move { inner.release_context().await })
                    .await
                    .map_err(|e| ModelError::ContextBusy(format!("Context transition aborted: {}", e)))??;

                if let Some(model_id) = released {
                    log::info!("Auto-released context of {} on {:?}", model_id, signal);
                    if signal == HostSignal::Backgrounded {
                        self.inner.machine.lock().await.released_on_background = Some(model_id);
                    }
                }
                Ok(())
            }
            HostSignal::Foregrounded => {
                let reload = {
                    let mut machine = self.inner.machine.lock().await;
                    match machine.state {
                        ContextState::Unloaded => machine.released_on_background.take(),
                        _ => {
                            machine.released_on_background = None;
                            None
                        }
                    }
                };
                if let Some(model_id) = reload {
                    log::info!("Reloading {} after returning to foreground", model_id);
                    self.init_context(&model_id).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn settings(&self) -> ManagerSettings {
        self.inner.settings.read().await.clone()
    }

    /// Params the next load will use
    pub async fn context_params(&self) -> ContextParams {
        ContextParams::from(&*self.inner.settings.read().await)
    }

    pub async fn set_use_auto_release(&self, enabled: bool) -> Result<(), ModelError> {
        self.inner.db.set_bool_setting(KEY_USE_AUTO_RELEASE, enabled)?;
        self.inner.settings.write().await.use_auto_release = enabled;
        Ok(())
    }

    /// Takes effect on the next load
    pub async fn set_use_acceleration(&self, enabled: bool) -> Result<(), ModelError> {
        self.inner.db.set_bool_setting(KEY_USE_ACCELERATION, enabled)?;
        self.inner.settings.write().await.use_acceleration = enabled;
        Ok(())
    }

    pub async fn set_n_context(&self, n_context: u32) -> Result<(), ModelError> {
        validate_n_context(n_context)?;
        self.inner.db.set_u32_setting(KEY_N_CONTEXT, n_context)?;
        self.inner.settings.write().await.n_context = n_context;
        Ok(())
    }

    pub async fn set_n_gpu_layers(&self, n_gpu_layers: u32) -> Result<(), ModelError> {
        validate_n_gpu_layers(n_gpu_layers)?;
        self.inner.db.set_u32_setting(KEY_N_GPU_LAYERS, n_gpu_layers)?;
        self.inner.settings.write().await.n_gpu_layers = n_gpu_layers;
        Ok(())
    }

    /// Replace all manager settings at once. Nothing is stored unless every
    /// value is valid; load params take effect on the next load.
    pub async fn update_settings(&self, settings: ManagerSettings) -> Result<(), ModelError> {
        validate_n_context(settings.n_context)?;
        validate_n_gpu_layers(settings.n_gpu_layers)?;
        self.inner.db.save_manager_settings(&settings)?;
        *self.inner.settings.write().await = settings;
        Ok(())
    }
}

fn validate_n_context(n_context: u32) -> Result<(), ModelError> {
    if n_context < MIN_CONTEXT_SIZE {
        return Err(ModelError::InvalidSetting {
            key: KEY_N_CONTEXT.to_string(),
            reason: format!("must be at least {}", MIN_CONTEXT_SIZE),
        });
    }
    Ok(())
}

fn validate_n_gpu_layers(n_gpu_layers: u32) -> Result<(), ModelError> {
    if !(MIN_GPU_LAYERS..=MAX_GPU_LAYERS).contains(&n_gpu_layers) {
        return Err(ModelError::InvalidSetting {
            key: KEY_N_GPU_LAYERS.to_string(),
            reason: format!("must be between {} and {}", MIN_GPU_LAYERS, MAX_GPU_LAYERS),
        });
    }
    Ok(())
}

impl Inner {
    fn emit(&self, model_id: &str, state: ContextState) {
        log::debug!("Context {} -> {:?}", model_id, state);
        let _ = self.events.send(ContextEvent {
            model_id: model_id.to_string(),
            state,
        });
    }

    async fn init_context(&self, model_id: &str) -> Result<ActiveContext, ModelError> {
        let entry = self
            .catalog
            .get(model_id)
            .await
            .ok_or_else(|| ModelError::ModelNotFound(model_id.to_string()))?;

        if self.downloads.is_downloading(model_id) {
            return Err(ModelError::ContextBusy(format!("{} is still downloading", model_id)));
        }
        let model_path = match (&entry.file_path, entry.is_downloaded) {
            (Some(path), true) => path.clone(),
            _ => return Err(ModelError::ArtifactMissing(model_id.to_string())),
        };
        if !is_file(&model_path).await {
            return Err(ModelError::ArtifactMissing(model_id.to_string()));
        }

        let params = ContextParams::from(&*self.settings.read().await);

        let previous = {
            let mut machine = self.machine.lock().await;
            match machine.state {
                ContextState::Loading | ContextState::Unloading => {
                    return Err(ModelError::ContextBusy(
                        "Another model is loading or unloading".to_string(),
                    ));
                }
                ContextState::Loaded => {
                    if let Some(active) = &machine.active {
                        if active.model_id == model_id && active.params == params {
                            return Ok(active.clone());
                        }
                    }
                    self.catalog.set_loading_model(Some(model_id.to_string())).await;
                    machine.state = ContextState::Unloading;
                    let previous = machine.active.take();
                    if let Some(prev) = &previous {
                        self.emit(&prev.model_id, ContextState::Unloading);
                    }
                    previous
                }
                ContextState::Unloaded => {
                    self.catalog.set_loading_model(Some(model_id.to_string())).await;
                    machine.state = ContextState::Loading;
                    machine.released_on_background = None;
                    self.emit(model_id, ContextState::Loading);
                    None
                }
            }
        };

        if let Some(prev) = previous {
            self.release_native(&prev).await;

            let mut machine = self.machine.lock().await;
            machine.state = ContextState::Unloaded;
            self.emit(&prev.model_id, ContextState::Unloaded);
            self.catalog.set_active_model(None).await;

            machine.state = ContextState::Loading;
            machine.released_on_background = None;
            self.emit(model_id, ContextState::Loading);
        }

        // Deletion is refused once the load is reserved; re-check for one that raced ahead of it
        if !is_file(&model_path).await {
            let mut machine = self.machine.lock().await;
            machine.state = ContextState::Unloaded;
            self.emit(model_id, ContextState::Unloaded);
            drop(machine);
            self.catalog.set_loading_model(None).await;
            return Err(ModelError::ArtifactMissing(model_id.to_string()));
        }

        log::info!("Loading model {} from {:?} with {:?}", model_id, model_path, params);
        let loaded = self.runtime.load(&model_path, params).await;

        let mut machine = self.machine.lock().await;
        match loaded {
            Ok(handle) => {
                let active = ActiveContext {
                    model_id: model_id.to_string(),
                    handle,
                    params,
                    model_path,
                    loaded_at: Utc::now(),
                };
                machine.active = Some(active.clone());
                machine.state = ContextState::Loaded;
                self.emit(model_id, ContextState::Loaded);
                self.catalog.set_active_model(Some(model_id.to_string())).await;
                self.catalog.set_loading_model(None).await;
                drop(machine);

                let touch = EntryPatch {
                    last_used_at: Some(active.loaded_at),
                    ..Default::default()
                };
                if let Err(e) = self.catalog.update_field(model_id, touch).await {
                    log::warn!("Failed to record last use of {}: {}", model_id, e);
                }
                log::info!("Model {} loaded", model_id);
                Ok(active)
            }
            Err(e) => {
                machine.state = ContextState::Unloaded;
                self.emit(model_id, ContextState::Unloaded);
                self.catalog.set_loading_model(None).await;
                log::error!("Failed to load model {}: {}", model_id, e);
                Err(ModelError::ContextLoadFailed {
                    model_id: model_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Loaded -> Unloading -> Unloaded. Returns the released model id, `None`
    /// when nothing was loaded.
    async fn release_context(&self) -> Result<Option<String>, ModelError> {
        let active = {
            let mut machine = self.machine.lock().await;
            match machine.state {
                ContextState::Unloaded => return Ok(None),
                ContextState::Loading | ContextState::Unloading => {
                    return Err(ModelError::ContextBusy(
                        "Another model is loading or unloading".to_string(),
                    ));
                }
                ContextState::Loaded => {
                    machine.state = ContextState::Unloading;
                    let active = machine.active.take();
                    if let Some(active) = &active {
                        self.emit(&active.model_id, ContextState::Unloading);
                    }
                    active
                }
            }
        };

        let Some(active) = active else {
            self.machine.lock().await.state = ContextState::Unloaded;
            return Ok(None);
        };

        self.release_native(&active).await;

        {
            let mut machine = self.machine.lock().await;
            machine.state = ContextState::Unloaded;
            self.emit(&active.model_id, ContextState::Unloaded);
            self.catalog.set_active_model(None).await;
        }
        log::info!("Released context of {}", active.model_id);
        Ok(Some(active.model_id))
    }

    /// Native release errors are logged; the context counts as gone either way
    async fn release_native(&self, active: &ActiveContext) {
        if let Err(e) = self.runtime.release(active.handle.clone()).await {
            log::warn!("Native release of {} reported an error: {}", active.model_id, e);
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}
