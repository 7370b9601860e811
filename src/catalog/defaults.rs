//! Bundled model presets, available for download out of the box

use std::path::Path;

use crate::config::DEFAULT_HUB_BASE_URL;
use crate::settings::TemplateKind;

use super::types::{ModelEntry, RemoteFileRef};

struct Preset {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    size_bytes: u64,
    hf_repo: &'static str,
    gguf_file: &'static str,
    template: TemplateKind,
}

const PRESETS: &[Preset] = &[
    Preset {
        id: "danube-3-500m-chat",
        name: "H2O Danube 3 500M Chat",
        description: "Tiny chat model, runs on almost any phone.",
        size_bytes: 368_000_000, // ~0.37 GB
        hf_repo: "h2oai/h2o-danube3-500m-chat-GGUF",
        gguf_file: "h2o-danube3-500m-chat-Q8_0.gguf",
        template: TemplateKind::ChatMl,
    },
    Preset {
        id: "llama-3.2-1b-instruct",
        name: "Llama 3.2 1B Instruct",
        description: "Smallest Llama model, fast and lightweight.",
        size_bytes: 808_000_000, // ~0.8 GB
        hf_repo: "bartowski/Llama-3.2-1B-Instruct-GGUF",
        gguf_file: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        template: TemplateKind::Llama3,
    },
    Preset {
        id: "gemma-2-2b-it",
        name: "Gemma 2 2B Instruct",
        description: "Google's small instruction-tuned model.",
        size_bytes: 1_710_000_000, // ~1.7 GB
        hf_repo: "bartowski/gemma-2-2b-it-GGUF",
        gguf_file: "gemma-2-2b-it-Q4_K_M.gguf",
        template: TemplateKind::Gemma,
    },
    Preset {
        id: "phi-3.5-mini",
        name: "Phi 3.5 Mini",
        description: "Microsoft's efficient small model.",
        size_bytes: 2_390_000_000, // ~2.4 GB
        hf_repo: "bartowski/Phi-3.5-mini-instruct-GGUF",
        gguf_file: "Phi-3.5-mini-instruct-Q4_K_M.gguf",
        template: TemplateKind::Phi3,
    },
    Preset {
        id: "qwen-2.5-1.5b-instruct",
        name: "Qwen 2.5 1.5B Instruct",
        description: "Alibaba's compact model with strong multilingual support.",
        size_bytes: 1_120_000_000, // ~1.1 GB
        hf_repo: "Qwen/Qwen2.5-1.5B-Instruct-GGUF",
        gguf_file: "qwen2.5-1.5b-instruct-q8_0.gguf",
        template: TemplateKind::ChatMl,
    },
];

/// Catalog entries for the bundled presets, with destinations under `models_dir`
pub fn bundled_models(models_dir: &Path) -> Vec<ModelEntry> {
    PRESETS
        .iter()
        .map(|p| {
            ModelEntry::bundled(
                p.id,
                p.name,
                p.description,
                p.size_bytes,
                RemoteFileRef::huggingface(DEFAULT_HUB_BASE_URL, p.hf_repo, p.gguf_file),
                p.template,
                models_dir,
            )
        })
        .collect()
}

/// Whether `model_id` names a bundled preset
pub fn is_bundled_id(model_id: &str) -> bool {
    PRESETS.iter().any(|p| p.id == model_id)
}
