//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::backend::gpu::GpuConfig;
use crate::registry::BackendKind;

/// Top-level engine settings. Deserializable so hosts can load it from
/// their own config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend every `invoke` dispatches to.
    pub backend: BackendKind,
    /// Adapter selection for the accelerator backend. Ignored unless the
    /// engine is built with `Engine::with_accelerator`.
    pub gpu: GpuConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vectorized,
            gpu: GpuConfig::default(),
        }
    }
}
