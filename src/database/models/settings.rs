// Database models - Settings
use serde::{Deserialize, Serialize};

/// Smallest context window the runtime accepts
pub const MIN_CONTEXT_SIZE: u32 = 200;
pub const DEFAULT_CONTEXT_SIZE: u32 = 1024;
pub const MIN_GPU_LAYERS: u32 = 1;
pub const MAX_GPU_LAYERS: u32 = 100;
pub const DEFAULT_GPU_LAYERS: u32 = 50;

/// Manager settings the user can change at runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerSettings {
    /// Release the context on memory pressure or when the app is backgrounded
    pub use_auto_release: bool,
    /// GPU offload (Metal on Apple devices)
    pub use_acceleration: bool,
    pub n_context: u32,
    pub n_gpu_layers: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            use_auto_release: true,
            use_acceleration: cfg!(any(target_os = "ios", target_os = "macos")),
            n_context: DEFAULT_CONTEXT_SIZE,
            n_gpu_layers: DEFAULT_GPU_LAYERS,
        }
    }
}
