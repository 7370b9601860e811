//! Native inference runtime interface

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::ManagerSettings;

/// Parameters a context is created with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextParams {
    pub n_context: u32,
    pub n_gpu_layers: u32,
    pub use_acceleration: bool,
}

impl From<&ManagerSettings> for ContextParams {
    fn from(settings: &ManagerSettings) -> Self {
        Self {
            n_context: settings.n_context,
            n_gpu_layers: settings.n_gpu_layers,
            use_acceleration: settings.use_acceleration,
        }
    }
}

/// Opaque reference to a loaded native context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub String);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    LoadFailed(String),
    #[error("Release failed: {0}")]
    ReleaseFailed(String),
}

/// The on-device inference engine, which can hold one context at a time
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    async fn load(&self, model_path: &Path, params: ContextParams) -> Result<NativeHandle, RuntimeError>;

    /// Free the native memory held by `handle`
    async fn release(&self, handle: NativeHandle) -> Result<(), RuntimeError>;
}
