//! Per-model generation settings and their patch types
//!
//! Overrides are stored as patches: `None` means "use the model default",
//! `Some(value)` is an explicit override. `Some("")` on a string field is an
//! explicit blank value, not a fallback.

use serde::{Deserialize, Serialize};

/// Prompt/template configuration used when formatting a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTemplateConfig {
    /// Template family name (e.g. "chatml", "llama3")
    pub name: String,
    pub add_bos_token: bool,
    pub add_generation_prompt: bool,
    pub bos_token: String,
    pub eos_token: String,
    /// Jinja-style template source
    pub chat_template: String,
    pub system_prompt: String,
}

/// Sampling parameters passed to the runtime for every completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionSettings {
    pub n_predict: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub min_p: f32,
    pub xtc_threshold: f32,
    pub xtc_probability: f32,
    pub typical_p: f32,
    pub penalty_last_n: u32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    /// 0 = disabled, 1 = Mirostat, 2 = Mirostat 2.0
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_nl: bool,
    pub seed: u64,
    pub n_probs: u32,
    pub stop: Vec<String>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            n_predict: 400,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            xtc_threshold: 0.1,
            xtc_probability: 0.0,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: false,
            seed: 0,
            n_probs: 0,
            stop: vec!["</s>".to_string()],
        }
    }
}

/// Named optional fields for a chat template update
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatTemplatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_bos_token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_generation_prompt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ChatTemplatePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copy every field present in `other` over this patch
    pub fn merge(&mut self, other: &ChatTemplatePatch) {
        merge_field(&mut self.name, &other.name);
        merge_field(&mut self.add_bos_token, &other.add_bos_token);
        merge_field(&mut self.add_generation_prompt, &other.add_generation_prompt);
        merge_field(&mut self.bos_token, &other.bos_token);
        merge_field(&mut self.eos_token, &other.eos_token);
        merge_field(&mut self.chat_template, &other.chat_template);
        merge_field(&mut self.system_prompt, &other.system_prompt);
    }

    /// Overlay this patch on `base`
    pub fn apply_to(&self, base: &ChatTemplateConfig) -> ChatTemplateConfig {
        ChatTemplateConfig {
            name: self.name.clone().unwrap_or_else(|| base.name.clone()),
            add_bos_token: self.add_bos_token.unwrap_or(base.add_bos_token),
            add_generation_prompt: self.add_generation_prompt.unwrap_or(base.add_generation_prompt),
            bos_token: self.bos_token.clone().unwrap_or_else(|| base.bos_token.clone()),
            eos_token: self.eos_token.clone().unwrap_or_else(|| base.eos_token.clone()),
            chat_template: self.chat_template.clone().unwrap_or_else(|| base.chat_template.clone()),
            system_prompt: self.system_prompt.clone().unwrap_or_else(|| base.system_prompt.clone()),
        }
    }
}

/// Named optional fields for a completion settings update
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtc_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtc_probability: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_last_n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_repeat: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_freq: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_present: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat_tau: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirostat_eta: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalize_nl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_probs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl CompletionSettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, other: &CompletionSettingsPatch) {
        merge_field(&mut self.n_predict, &other.n_predict);
        merge_field(&mut self.temperature, &other.temperature);
        merge_field(&mut self.top_k, &other.top_k);
        merge_field(&mut self.top_p, &other.top_p);
        merge_field(&mut self.min_p, &other.min_p);
        merge_field(&mut self.xtc_threshold, &other.xtc_threshold);
        merge_field(&mut self.xtc_probability, &other.xtc_probability);
        merge_field(&mut self.typical_p, &other.typical_p);
        merge_field(&mut self.penalty_last_n, &other.penalty_last_n);
        merge_field(&mut self.penalty_repeat, &other.penalty_repeat);
        merge_field(&mut self.penalty_freq, &other.penalty_freq);
        merge_field(&mut self.penalty_present, &other.penalty_present);
        merge_field(&mut self.mirostat, &other.mirostat);
        merge_field(&mut self.mirostat_tau, &other.mirostat_tau);
        merge_field(&mut self.mirostat_eta, &other.mirostat_eta);
        merge_field(&mut self.penalize_nl, &other.penalize_nl);
        merge_field(&mut self.seed, &other.seed);
        merge_field(&mut self.n_probs, &other.n_probs);
        merge_field(&mut self.stop, &other.stop);
    }

    pub fn apply_to(&self, base: &CompletionSettings) -> CompletionSettings {
        CompletionSettings {
            n_predict: self.n_predict.unwrap_or(base.n_predict),
            temperature: self.temperature.unwrap_or(base.temperature),
            top_k: self.top_k.unwrap_or(base.top_k),
            top_p: self.top_p.unwrap_or(base.top_p),
            min_p: self.min_p.unwrap_or(base.min_p),
            xtc_threshold: self.xtc_threshold.unwrap_or(base.xtc_threshold),
            xtc_probability: self.xtc_probability.unwrap_or(base.xtc_probability),
            typical_p: self.typical_p.unwrap_or(base.typical_p),
            penalty_last_n: self.penalty_last_n.unwrap_or(base.penalty_last_n),
            penalty_repeat: self.penalty_repeat.unwrap_or(base.penalty_repeat),
            penalty_freq: self.penalty_freq.unwrap_or(base.penalty_freq),
            penalty_present: self.penalty_present.unwrap_or(base.penalty_present),
            mirostat: self.mirostat.unwrap_or(base.mirostat),
            mirostat_tau: self.mirostat_tau.unwrap_or(base.mirostat_tau),
            mirostat_eta: self.mirostat_eta.unwrap_or(base.mirostat_eta),
            penalize_nl: self.penalize_nl.unwrap_or(base.penalize_nl),
            seed: self.seed.unwrap_or(base.seed),
            n_probs: self.n_probs.unwrap_or(base.n_probs),
            stop: self.stop.clone().unwrap_or_else(|| base.stop.clone()),
        }
    }
}

fn merge_field<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if let Some(value) = source {
        *target = Some(value.clone());
    }
}
