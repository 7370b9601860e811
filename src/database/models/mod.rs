// Database models
//
// - settings.rs: the typed manager settings and their bounds

mod settings;

pub use settings::{
    ManagerSettings, DEFAULT_CONTEXT_SIZE, DEFAULT_GPU_LAYERS, MAX_GPU_LAYERS,
    MIN_CONTEXT_SIZE, MIN_GPU_LAYERS,
};
