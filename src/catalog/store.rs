//! ModelCatalog - the single writer of model entry state
//!
//! Every mutation is persisted to the database first, then applied in memory and
//! announced exactly once on the catalog event channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::database::DatabaseManager;
use crate::error::ModelError;
use crate::settings::{ChatTemplatePatch, CompletionSettingsPatch};

use super::defaults::bundled_models;
use super::types::{EntryPatch, ModelEntry, ModelOrigin};

const EVENT_CAPACITY: usize = 256;

/// Change notification for catalog observers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogEvent {
    Added { entry: ModelEntry },
    Updated { entry: ModelEntry },
    Removed { model_id: String },
    /// Many entries changed at once; observers should re-read the list
    Reset,
    ActiveChanged { model_id: Option<String> },
}

pub struct ModelCatalog {
    entries: RwLock<Vec<ModelEntry>>,
    active_model: RwLock<Option<String>>,
    /// Model a context load is in flight for
    loading_model: RwLock<Option<String>>,
    db: Arc<DatabaseManager>,
    models_dir: PathBuf,
    events: broadcast::Sender<CatalogEvent>,
}

impl ModelCatalog {
    pub fn new(db: Arc<DatabaseManager>, models_dir: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(Vec::new()),
            active_model: RwLock::new(None),
            loading_model: RwLock::new(None),
            db,
            models_dir,
            events,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CatalogEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Restore persisted entries and add any bundled preset that is missing.
    /// Returns the number of entries in the catalog.
    pub async fn load_from_store(&self) -> Result<usize, ModelError> {
        let mut stored = self.db.load_model_entries()?;
        stored.retain(|e| match e.check_invariants() {
            Ok(()) => true,
            Err(reason) => {
                log::warn!("Dropping stored model entry {}: {}", e.id, reason);
                false
            }
        });

        for preset in bundled_models(&self.models_dir) {
            if !stored.iter().any(|e| e.id == preset.id) {
                self.db.upsert_model_entry(&preset)?;
                stored.push(preset);
            }
        }

        let count = stored.len();
        *self.entries.write().await = stored;
        log::info!("Model catalog loaded with {} entries", count);
        self.publish(CatalogEvent::Reset);
        Ok(count)
    }

    pub async fn add(&self, entry: ModelEntry) -> Result<(), ModelError> {
        entry.check_invariants().map_err(|reason| ModelError::InvalidPatch {
            model_id: entry.id.clone(),
            reason,
        })?;

        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(ModelError::AlreadyExists(entry.id));
        }

        self.db.upsert_model_entry(&entry)?;
        log::info!("Added model {} ({})", entry.id, entry.origin.as_str());
        entries.push(entry.clone());
        drop(entries);

        self.publish(CatalogEvent::Added { entry });
        Ok(())
    }

    /// Refused while the artifact is on disk or the model holds (or is about to
    /// hold) the native context
    pub async fn remove(&self, model_id: &str) -> Result<(), ModelError> {
        let in_use = self.context_use(model_id).await;
        let mut entries = self.entries.write().await;

        let index = entries
            .iter()
            .position(|e| e.id == model_id)
            .ok_or_else(|| ModelError::ModelNotFound(model_id.to_string()))?;

        if let Some(reason) = in_use {
            return Err(ModelError::RemovalBlocked {
                model_id: model_id.to_string(),
                reason: reason.to_string(),
            });
        }
        if entries[index].is_downloaded {
            return Err(ModelError::RemovalBlocked {
                model_id: model_id.to_string(),
                reason: "The model file is still on the device. Delete it first.".to_string(),
            });
        }

        self.db.delete_model_entry(model_id)?;
        entries.remove(index);
        drop(entries);

        log::info!("Removed model {}", model_id);
        self.publish(CatalogEvent::Removed {
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, model_id: &str) -> Option<ModelEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == model_id)
            .cloned()
    }

    pub async fn contains(&self, model_id: &str) -> bool {
        self.entries.read().await.iter().any(|e| e.id == model_id)
    }

    pub async fn list(&self) -> Vec<ModelEntry> {
        self.entries.read().await.clone()
    }

    /// Entries whose artifact is on disk
    pub async fn downloaded(&self) -> Vec<ModelEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.is_downloaded)
            .cloned()
            .collect()
    }

    /// Validate and apply a partial update, returning the updated entry
    pub async fn update_field(&self, model_id: &str, patch: EntryPatch) -> Result<ModelEntry, ModelError> {
        if let Some(progress) = patch.download_progress {
            if !progress.is_finite() || !(0.0..=1.0).contains(&progress) {
                return Err(ModelError::InvalidPatch {
                    model_id: model_id.to_string(),
                    reason: format!("download progress {} is outside 0..=1", progress),
                });
            }
        }

        let mut entries = self.entries.write().await;
        let slot = entries
            .iter_mut()
            .find(|e| e.id == model_id)
            .ok_or_else(|| ModelError::ModelNotFound(model_id.to_string()))?;

        let mut updated = slot.clone();
        patch.apply(&mut updated);
        updated
            .check_invariants()
            .map_err(|reason| ModelError::InvalidPatch {
                model_id: model_id.to_string(),
                reason,
            })?;

        if updated == *slot {
            return Ok(updated);
        }

        self.db.upsert_model_entry(&updated)?;
        *slot = updated.clone();
        drop(entries);

        self.publish(CatalogEvent::Updated {
            entry: updated.clone(),
        });
        Ok(updated)
    }

    /// Marks the model holding the native context; `None` when nothing is loaded
    pub async fn set_active_model(&self, model_id: Option<String>) {
        let mut active = self.active_model.write().await;
        if *active == model_id {
            return;
        }
        *active = model_id.clone();
        drop(active);
        self.publish(CatalogEvent::ActiveChanged { model_id });
    }

    pub async fn active_model_id(&self) -> Option<String> {
        self.active_model.read().await.clone()
    }

    /// Reserves `model_id` as the target of a context load until the load settles
    pub async fn set_loading_model(&self, model_id: Option<String>) {
        *self.loading_model.write().await = model_id;
    }

    pub async fn loading_model_id(&self) -> Option<String> {
        self.loading_model.read().await.clone()
    }

    /// Why `model_id` is tied to the native context, if it is
    pub async fn context_use(&self, model_id: &str) -> Option<&'static str> {
        if self.loading_model.read().await.as_deref() == Some(model_id) {
            return Some("The model is being loaded. Wait for it to finish and release it first.");
        }
        if self.active_model.read().await.as_deref() == Some(model_id) {
            return Some("The model is currently loaded. Release it first.");
        }
        None
    }

    /// Re-add missing presets and reset existing ones to their shipped metadata.
    /// Download state of presets is kept, Local and Remote entries are untouched.
    pub async fn restore_bundled_defaults(&self) -> Result<(), ModelError> {
        self.reset_entries(false).await
    }

    /// `restore_bundled_defaults` plus clearing every settings override
    pub async fn reset_models(&self) -> Result<(), ModelError> {
        self.reset_entries(true).await
    }

    async fn reset_entries(&self, clear_overrides: bool) -> Result<(), ModelError> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();

        for preset in bundled_models(&self.models_dir) {
            match next.iter_mut().find(|e| e.id == preset.id) {
                Some(existing) => {
                    let mut fresh = preset;
                    fresh.is_downloaded = existing.is_downloaded;
                    fresh.download_progress = existing.download_progress;
                    fresh.download_speed_bytes_per_sec = existing.download_speed_bytes_per_sec;
                    fresh.last_used_at = existing.last_used_at;
                    if existing.origin == ModelOrigin::Bundled && existing.file_path.is_some() {
                        fresh.file_path = existing.file_path.clone();
                    }
                    if !clear_overrides {
                        fresh.chat_template_override = existing.chat_template_override.clone();
                        fresh.completion_settings_override =
                            existing.completion_settings_override.clone();
                    }
                    *existing = fresh;
                }
                None => next.push(preset),
            }
        }

        if clear_overrides {
            for entry in next.iter_mut() {
                entry.chat_template_override = ChatTemplatePatch::default();
                entry.completion_settings_override = CompletionSettingsPatch::default();
            }
        }

        for entry in next.iter().filter(|e| !entries.contains(e)) {
            self.db.upsert_model_entry(entry)?;
        }
        *entries = next;
        drop(entries);

        log::info!("Model catalog reset (overrides cleared: {})", clear_overrides);
        self.publish(CatalogEvent::Reset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RemoteFileRef;
    use crate::settings::CompletionSettingsPatch;

    fn catalog() -> ModelCatalog {
        let db = Arc::new(DatabaseManager::in_memory().unwrap());
        ModelCatalog::new(db, PathBuf::from("/data/models"))
    }

    fn remote(name: &str) -> ModelEntry {
        ModelEntry::remote(
            RemoteFileRef::huggingface("https://huggingface.co", "org/repo", name),
            1_000,
        )
    }

    #[tokio::test]
    async fn test_add_get_and_duplicate() {
        let catalog = catalog();
        let entry = remote("a.gguf");
        catalog.add(entry.clone()).await.unwrap();

        assert_eq!(catalog.get(&entry.id).await, Some(entry.clone()));
        assert!(matches!(
            catalog.add(entry).await,
            Err(ModelError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_one_event_per_mutation() {
        let catalog = catalog();
        let mut rx = catalog.subscribe();
        let entry = remote("a.gguf");

        catalog.add(entry.clone()).await.unwrap();
        catalog
            .update_field(&entry.id, EntryPatch::progress(0.5, 10))
            .await
            .unwrap();
        // Same values again: nothing changed, nothing published
        catalog
            .update_field(&entry.id, EntryPatch::progress(0.5, 10))
            .await
            .unwrap();
        catalog.remove(&entry.id).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), CatalogEvent::Added { .. }));
        assert!(matches!(rx.recv().await.unwrap(), CatalogEvent::Updated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), CatalogEvent::Removed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_blocked() {
        let catalog = catalog();
        let entry = remote("a.gguf");
        catalog.add(entry.clone()).await.unwrap();

        catalog.set_active_model(Some(entry.id.clone())).await;
        assert!(matches!(
            catalog.remove(&entry.id).await,
            Err(ModelError::RemovalBlocked { .. })
        ));
        catalog.set_active_model(None).await;

        catalog.set_loading_model(Some(entry.id.clone())).await;
        assert!(matches!(
            catalog.remove(&entry.id).await,
            Err(ModelError::RemovalBlocked { .. })
        ));
        catalog.set_loading_model(None).await;
        assert_eq!(catalog.context_use(&entry.id).await, None);

        catalog
            .update_field(&entry.id, EntryPatch::downloaded(PathBuf::from("/data/a.gguf"), 1_000))
            .await
            .unwrap();
        assert!(matches!(
            catalog.remove(&entry.id).await,
            Err(ModelError::RemovalBlocked { .. })
        ));

        assert!(matches!(
            catalog.remove("missing").await,
            Err(ModelError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_patches_rejected() {
        let catalog = catalog();
        let entry = remote("a.gguf");
        catalog.add(entry.clone()).await.unwrap();

        let err = catalog
            .update_field(&entry.id, EntryPatch::progress(1.5, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidPatch { .. }));

        let path_only = EntryPatch {
            file_path: Some(Some(PathBuf::from("/data/a.gguf"))),
            ..Default::default()
        };
        assert!(catalog.update_field(&entry.id, path_only).await.is_err());
        assert_eq!(catalog.get(&entry.id).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_load_from_store_merges_presets() {
        let db = Arc::new(DatabaseManager::in_memory().unwrap());
        let first = ModelCatalog::new(db.clone(), PathBuf::from("/data/models"));
        let presets = first.load_from_store().await.unwrap();
        first.add(remote("a.gguf")).await.unwrap();

        let second = ModelCatalog::new(db, PathBuf::from("/data/models"));
        assert_eq!(second.load_from_store().await.unwrap(), presets + 1);
        assert!(second.contains(&remote("a.gguf").id).await);
    }

    #[tokio::test]
    async fn test_reset_models_keeps_downloads() {
        let catalog = catalog();
        catalog.load_from_store().await.unwrap();
        let preset = catalog.list().await[0].clone();
        let path = preset.file_path.clone().unwrap();

        catalog
            .update_field(&preset.id, EntryPatch::downloaded(path.clone(), preset.size_bytes))
            .await
            .unwrap();
        catalog
            .update_field(
                &preset.id,
                EntryPatch {
                    completion_settings_override: Some(CompletionSettingsPatch {
                        n_predict: Some(10),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        catalog.remove(&catalog.list().await[1].id.clone()).await.unwrap();
        let local = ModelEntry::local(PathBuf::from("/data/models/local/x.gguf"), 5);
        catalog.add(local.clone()).await.unwrap();

        catalog.reset_models().await.unwrap();

        let after = catalog.get(&preset.id).await.unwrap();
        assert!(after.is_downloaded);
        assert_eq!(after.file_path, Some(path));
        assert!(after.completion_settings_override.is_empty());
        assert!(catalog.contains(&local.id).await);
        assert_eq!(
            catalog.list().await.iter().filter(|e| e.origin == ModelOrigin::Bundled).count(),
            bundled_models(Path::new("/data/models")).len()
        );
    }
}
