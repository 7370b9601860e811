//! Native inference context lifecycle
//!
//! - `runtime.rs`: the runtime interface and context parameters
//! - `manager.rs`: the single-context state machine and auto-release policy
//! - `sidecar.rs`: JSON-RPC client for a runtime hosted in a child process

pub mod manager;
pub mod runtime;
pub mod sidecar;

pub use manager::{ActiveContext, ContextEvent, ContextLifecycleManager, ContextState, HostSignal};
pub use runtime::{ContextParams, InferenceRuntime, NativeHandle, RuntimeError};
pub use sidecar::{SidecarConfig, SidecarRuntime};
