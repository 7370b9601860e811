//! Model catalog types

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::{
    ChatTemplateConfig, ChatTemplatePatch, CompletionSettings, CompletionSettingsPatch, TemplateKind,
};

/// Where a catalog entry came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelOrigin {
    /// Shipped preset, downloaded on demand
    Bundled,
    /// Imported by the user from a file on the device
    Local,
    /// Bookmarked from the remote catalog
    Remote,
}

impl ModelOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelOrigin::Bundled => "bundled",
            ModelOrigin::Local => "local",
            ModelOrigin::Remote => "remote",
        }
    }
}

/// Reference to an artifact in the remote catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFileRef {
    /// Repository id, e.g. "bartowski/Llama-3.2-1B-Instruct-GGUF"
    pub repo_id: String,
    pub filename: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl RemoteFileRef {
    /// Direct download link for a file in a Hugging Face style repository
    pub fn huggingface(base_url: &str, repo_id: &str, filename: &str) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            filename: filename.to_string(),
            download_url: format!(
                "{}/{}/resolve/main/{}",
                base_url.trim_end_matches('/'),
                repo_id,
                filename
            ),
            sha256: None,
        }
    }
}

/// A model known to the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub origin: ModelOrigin,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Artifact location; see `check_invariants` for when this is set
    pub file_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub is_downloaded: bool,
    /// 0.0 to 1.0
    pub download_progress: f32,
    pub download_speed_bytes_per_sec: u64,
    pub remote_file_ref: Option<RemoteFileRef>,
    pub template_kind: TemplateKind,
    #[serde(default)]
    pub chat_template_override: ChatTemplatePatch,
    #[serde(default)]
    pub completion_settings_override: CompletionSettingsPatch,
    /// UI grouping only
    pub group: String,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ModelEntry {
    /// Preset entry; the file path is the planned download destination
    pub fn bundled(
        id: &str,
        display_name: &str,
        description: &str,
        size_bytes: u64,
        remote: RemoteFileRef,
        template_kind: TemplateKind,
        models_dir: &Path,
    ) -> Self {
        let file_path = download_path(models_dir, id, &remote.filename);
        Self {
            id: id.to_string(),
            origin: ModelOrigin::Bundled,
            display_name: display_name.to_string(),
            description: Some(description.to_string()),
            file_path: Some(file_path),
            size_bytes,
            is_downloaded: false,
            download_progress: 0.0,
            download_speed_bytes_per_sec: 0,
            group: group_for(display_name),
            remote_file_ref: Some(remote),
            template_kind,
            chat_template_override: ChatTemplatePatch::default(),
            completion_settings_override: CompletionSettingsPatch::default(),
            last_used_at: None,
        }
    }

    /// Entry for a file already copied into local storage
    pub fn local(path: PathBuf, size_bytes: u64) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "model.gguf".to_string());

        Self {
            id: format!("local/{}", filename),
            origin: ModelOrigin::Local,
            display_name: display_name_for(&filename),
            description: None,
            file_path: Some(path),
            size_bytes,
            is_downloaded: true,
            download_progress: 1.0,
            download_speed_bytes_per_sec: 0,
            remote_file_ref: None,
            template_kind: TemplateKind::from_filename(&filename),
            chat_template_override: ChatTemplatePatch::default(),
            completion_settings_override: CompletionSettingsPatch::default(),
            group: "local".to_string(),
            last_used_at: None,
        }
    }

    /// Bookmark for a remote artifact, not yet downloaded
    pub fn remote(remote: RemoteFileRef, size_bytes: u64) -> Self {
        let display_name = display_name_for(&remote.filename);
        Self {
            id: format!("{}/{}", remote.repo_id, remote.filename),
            origin: ModelOrigin::Remote,
            group: group_for(&remote.repo_id),
            template_kind: TemplateKind::from_filename(&format!("{}/{}", remote.repo_id, remote.filename)),
            display_name,
            description: Some(remote.repo_id.clone()),
            file_path: None,
            size_bytes,
            is_downloaded: false,
            download_progress: 0.0,
            download_speed_bytes_per_sec: 0,
            remote_file_ref: Some(remote),
            chat_template_override: ChatTemplatePatch::default(),
            completion_settings_override: CompletionSettingsPatch::default(),
            last_used_at: None,
        }
    }

    /// Where a download for this entry lands
    pub fn download_destination(&self, models_dir: &Path) -> Option<PathBuf> {
        match self.origin {
            ModelOrigin::Bundled => self.file_path.clone(),
            ModelOrigin::Remote => self
                .remote_file_ref
                .as_ref()
                .map(|r| download_path(models_dir, &self.id, &r.filename)),
            ModelOrigin::Local => None,
        }
    }

    pub fn default_chat_template(&self) -> ChatTemplateConfig {
        self.template_kind.default_chat_template()
    }

    pub fn default_completion_settings(&self) -> CompletionSettings {
        self.template_kind.default_completion_settings()
    }

    /// Defaults overlaid with the user's overrides
    pub fn effective_chat_template(&self) -> ChatTemplateConfig {
        self.chat_template_override.apply_to(&self.default_chat_template())
    }

    pub fn effective_completion_settings(&self) -> CompletionSettings {
        self.completion_settings_override
            .apply_to(&self.default_completion_settings())
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.download_progress) {
            return Err(format!("download progress {} out of range", self.download_progress));
        }
        match self.origin {
            ModelOrigin::Local | ModelOrigin::Bundled if self.file_path.is_none() => {
                Err(format!("{} entries must keep a file path", self.origin.as_str()))
            }
            ModelOrigin::Remote if self.remote_file_ref.is_none() => {
                Err("remote entries need a remote file reference".to_string())
            }
            ModelOrigin::Remote if self.file_path.is_some() != self.is_downloaded => {
                Err("remote entries have a file path only when downloaded".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Explicit partial update of a catalog entry; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub display_name: Option<String>,
    pub file_path: Option<Option<PathBuf>>,
    pub size_bytes: Option<u64>,
    pub is_downloaded: Option<bool>,
    pub download_progress: Option<f32>,
    pub download_speed_bytes_per_sec: Option<u64>,
    pub remote_file_ref: Option<RemoteFileRef>,
    pub chat_template_override: Option<ChatTemplatePatch>,
    pub completion_settings_override: Option<CompletionSettingsPatch>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl EntryPatch {
    pub fn progress(progress: f32, speed_bytes_per_sec: u64) -> Self {
        Self {
            download_progress: Some(progress),
            download_speed_bytes_per_sec: Some(speed_bytes_per_sec),
            ..Default::default()
        }
    }

    /// Artifact materialized at `path`
    pub fn downloaded(path: PathBuf, size_bytes: u64) -> Self {
        Self {
            file_path: Some(Some(path)),
            size_bytes: Some(size_bytes),
            is_downloaded: Some(true),
            download_progress: Some(1.0),
            download_speed_bytes_per_sec: Some(0),
            ..Default::default()
        }
    }

    /// Artifact gone; remote entries also lose their path
    pub fn not_downloaded(origin: ModelOrigin) -> Self {
        Self {
            file_path: if origin == ModelOrigin::Remote { Some(None) } else { None },
            is_downloaded: Some(false),
            download_progress: Some(0.0),
            download_speed_bytes_per_sec: Some(0),
            ..Default::default()
        }
    }

    pub fn apply(&self, entry: &mut ModelEntry) {
        if let Some(v) = &self.display_name {
            entry.display_name = v.clone();
        }
        if let Some(v) = &self.file_path {
            entry.file_path = v.clone();
        }
        if let Some(v) = self.size_bytes {
            entry.size_bytes = v;
        }
        if let Some(v) = self.is_downloaded {
            entry.is_downloaded = v;
        }
        if let Some(v) = self.download_progress {
            entry.download_progress = v;
        }
        if let Some(v) = self.download_speed_bytes_per_sec {
            entry.download_speed_bytes_per_sec = v;
        }
        if let Some(v) = &self.remote_file_ref {
            entry.remote_file_ref = Some(v.clone());
        }
        if let Some(v) = &self.chat_template_override {
            entry.chat_template_override = v.clone();
        }
        if let Some(v) = &self.completion_settings_override {
            entry.completion_settings_override = v.clone();
        }
        if let Some(v) = self.last_used_at {
            entry.last_used_at = Some(v);
        }
    }
}

/// `<models_dir>/<id>/<filename>`, with the id mapped to a single directory name
pub fn download_path(models_dir: &Path, model_id: &str, filename: &str) -> PathBuf {
    models_dir.join(safe_dir_name(model_id)).join(filename)
}

fn safe_dir_name(model_id: &str) -> String {
    model_id
        .replace('/', "__")
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn display_name_for(filename: &str) -> String {
    filename
        .strip_suffix(".gguf")
        .or_else(|| filename.strip_suffix(".GGUF"))
        .unwrap_or(filename)
        .to_string()
}

/// Model family used to group entries in the UI
pub fn group_for(name: &str) -> String {
    let lower = name.to_lowercase();
    for (needle, group) in [
        ("llama", "Llama"),
        ("phi", "Phi"),
        ("gemma", "Gemma"),
        ("qwen", "Qwen"),
        ("mistral", "Mistral"),
        ("danube", "Danube"),
        ("smollm", "SmolLM"),
    ] {
        if lower.contains(needle) {
            return group.to_string();
        }
    }
    "Other".to_string()
}
