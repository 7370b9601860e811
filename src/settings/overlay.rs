// Settings overlay - per-model overrides on top of the type defaults

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::catalog::{EntryPatch, ModelCatalog, ModelEntry};
use crate::error::ModelError;

use super::types::{ChatTemplateConfig, ChatTemplatePatch, CompletionSettings, CompletionSettingsPatch};
use super::validation::{validate_chat_template_patch, validate_completion_patch};

pub struct SettingsOverlay {
    catalog: Arc<ModelCatalog>,
    // Serializes read-merge-write of overrides
    write_lock: Mutex<()>,
}

impl SettingsOverlay {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            write_lock: Mutex::new(()),
        }
    }

    async fn entry(&self, model_id: &str) -> Result<ModelEntry, ModelError> {
        self.catalog
            .get(model_id)
            .await
            .ok_or_else(|| ModelError::ModelNotFound(model_id.to_string()))
    }

    /// Validate `patch` and merge it field by field into the model's override
    pub async fn update_chat_template(
        &self,
        model_id: &str,
        patch: ChatTemplatePatch,
    ) -> Result<ChatTemplateConfig, ModelError> {
        let errors = validate_chat_template_patch(&patch);
        if !errors.is_empty() {
            return Err(ModelError::InvalidPatch {
                model_id: model_id.to_string(),
                reason: errors.join("; "),
            });
        }

        let _guard = self.write_lock.lock().await;
        let mut merged = self.entry(model_id).await?.chat_template_override;
        merged.merge(&patch);

        let updated = self
            .catalog
            .update_field(
                model_id,
                EntryPatch {
                    chat_template_override: Some(merged),
                    ..Default::default()
                },
            )
            .await?;
        Ok(updated.effective_chat_template())
    }

    pub async fn update_completion_settings(
        &self,
        model_id: &str,
        patch: CompletionSettingsPatch,
    ) -> Result<CompletionSettings, ModelError> {
        let errors = validate_completion_patch(&patch);
        if !errors.is_empty() {
            return Err(ModelError::InvalidPatch {
                model_id: model_id.to_string(),
                reason: errors.join("; "),
            });
        }

        let _guard = self.write_lock.lock().await;
        let mut merged = self.entry(model_id).await?.completion_settings_override;
        merged.merge(&patch);

        let updated = self
            .catalog
            .update_field(
                model_id,
                EntryPatch {
                    completion_settings_override: Some(merged),
                    ..Default::default()
                },
            )
            .await?;
        Ok(updated.effective_completion_settings())
    }

    /// Drop the chat template override; idempotent
    pub async fn reset_chat_template(&self, model_id: &str) -> Result<ChatTemplateConfig, ModelError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .catalog
            .update_field(
                model_id,
                EntryPatch {
                    chat_template_override: Some(ChatTemplatePatch::default()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(updated.effective_chat_template())
    }

    /// Drop the completion settings override; idempotent
    pub async fn reset_completion_settings(&self, model_id: &str) -> Result<CompletionSettings, ModelError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .catalog
            .update_field(
                model_id,
                EntryPatch {
                    completion_settings_override: Some(CompletionSettingsPatch::default()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(updated.effective_completion_settings())
    }

    pub async fn effective_chat_template(&self, model_id: &str) -> Result<ChatTemplateConfig, ModelError> {
        Ok(self.entry(model_id).await?.effective_chat_template())
    }

    pub async fn effective_completion_settings(&self, model_id: &str) -> Result<CompletionSettings, ModelError> {
        Ok(self.entry(model_id).await?.effective_completion_settings())
    }

    /// Clear every override and restore the bundled presets.
    /// Downloaded artifacts and imported models are kept.
    pub async fn reset_all(&self) -> Result<(), ModelError> {
        let _guard = self.write_lock.lock().await;
        self.catalog.reset_models().await
    }
}
