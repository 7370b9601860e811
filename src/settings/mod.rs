//! Per-model chat template and completion settings
//!
//! - `types.rs`: settings and their patch types
//! - `templates.rs`: template families and their defaults
//! - `validation.rs`: numeric rules for completion settings
//! - `overlay.rs`: override updates and resets on catalog entries

pub mod overlay;
pub mod templates;
pub mod types;
pub mod validation;

pub use overlay::SettingsOverlay;
pub use templates::TemplateKind;
pub use types::{ChatTemplateConfig, ChatTemplatePatch, CompletionSettings, CompletionSettingsPatch};
pub use validation::{validate_chat_template_patch, validate_completion_patch};
