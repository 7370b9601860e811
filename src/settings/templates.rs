//! Built-in template families and the defaults each family implies

use serde::{Deserialize, Serialize};

use super::types::{ChatTemplateConfig, CompletionSettings};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, concise assistant.";

const CHATML_TEMPLATE: &str = "{% for message in messages %}{{'<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n'}}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

const LLAMA3_TEMPLATE: &str = "{% set loop_messages = messages %}{% for message in loop_messages %}{% set content = '<|start_header_id|>' + message['role'] + '<|end_header_id|>\\n\\n'+ message['content'] | trim + '<|eot_id|>' %}{% if loop.index0 == 0 %}{% set content = bos_token + content %}{% endif %}{{ content }}{% endfor %}{% if add_generation_prompt %}{{ '<|start_header_id|>assistant<|end_header_id|>\\n\\n' }}{% endif %}";

const PHI3_TEMPLATE: &str = "{% for message in messages %}{{'<|' + message['role'] + '|>' + '\\n' + message['content'] + '<|end|>\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|assistant|>\\n' }}{% endif %}";

const GEMMA_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}{% set role = 'model' if message['role'] == 'assistant' else message['role'] %}{{ '<start_of_turn>' + role + '\\n' + message['content'] | trim + '<end_of_turn>\\n' }}{% endfor %}{% if add_generation_prompt %}{{'<start_of_turn>model\\n'}}{% endif %}";

/// Template family of a model, chosen from its file name when not bundled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    ChatMl,
    Llama3,
    Phi3,
    Gemma,
}

impl TemplateKind {
    /// Guess the family from an artifact or repository name
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("llama-3") || lower.contains("llama3") {
            TemplateKind::Llama3
        } else if lower.contains("phi-3") || lower.contains("phi3") {
            TemplateKind::Phi3
        } else if lower.contains("gemma") {
            TemplateKind::Gemma
        } else {
            TemplateKind::ChatMl
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::ChatMl => "chatml",
            TemplateKind::Llama3 => "llama3",
            TemplateKind::Phi3 => "phi3",
            TemplateKind::Gemma => "gemmaIt",
        }
    }

    pub fn default_chat_template(&self) -> ChatTemplateConfig {
        let (add_bos_token, bos_token, eos_token, template) = match self {
            TemplateKind::ChatMl => (false, "", "<|im_end|>", CHATML_TEMPLATE),
            TemplateKind::Llama3 => (false, "<|begin_of_text|>", "<|eot_id|>", LLAMA3_TEMPLATE),
            TemplateKind::Phi3 => (false, "", "<|end|>", PHI3_TEMPLATE),
            TemplateKind::Gemma => (false, "<bos>", "<end_of_turn>", GEMMA_TEMPLATE),
        };

        ChatTemplateConfig {
            name: self.name().to_string(),
            add_bos_token,
            add_generation_prompt: true,
            bos_token: bos_token.to_string(),
            eos_token: eos_token.to_string(),
            chat_template: template.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn default_completion_settings(&self) -> CompletionSettings {
        let stop: &[&str] = match self {
            TemplateKind::ChatMl => &["<|im_end|>"],
            TemplateKind::Llama3 => &["<|eot_id|>"],
            TemplateKind::Phi3 => &["<|end|>"],
            TemplateKind::Gemma => &["<end_of_turn>"],
        };

        CompletionSettings {
            stop: stop.iter().map(|s| s.to_string()).collect(),
            ..CompletionSettings::default()
        }
    }
}
