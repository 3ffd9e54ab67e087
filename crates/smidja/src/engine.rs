//! The engine: one dispatch surface over the registered backends.

use std::sync::Arc;

use crate::autograd::{BackwardArgs, GradThunk, GradientRegistry};
use crate::backend;
use crate::backend::gpu::WgpuContext;
use crate::error::{KernelError, KernelResult};
use crate::ops::{Attributes, Op};
use crate::registry::{BackendKind, KernelRegistry};
use crate::tensor::{DType, Tensor, TensorData};

pub use crate::config::EngineConfig;

/// Owns the kernel table, the gradient bindings and (when requested) the
/// device context, and dispatches every call to the configured backend.
pub struct Engine {
    registry: KernelRegistry,
    gradients: GradientRegistry,
    backend: BackendKind,
    gpu: Option<Arc<WgpuContext>>,
}

impl Engine {
    /// Builds a host-only engine. All three backends are registered, but
    /// accelerator calls fail until a device context exists; use
    /// [`Engine::with_accelerator`] for GPU dispatch.
    pub fn new(config: EngineConfig) -> KernelResult<Self> {
        let mut registry = KernelRegistry::new();
        backend::reference::register(&mut registry)?;
        backend::vectorized::register(&mut registry)?;
        backend::gpu::register(&mut registry)?;
        Ok(Self {
            registry,
            gradients: GradientRegistry::with_defaults()?,
            backend: config.backend,
            gpu: None,
        })
    }

    /// Builds an engine bound to a wgpu device and dispatching to the
    /// accelerator backend. Fails when no adapter matches the config.
    pub async fn with_accelerator(config: EngineConfig) -> KernelResult<Self> {
        let ctx = WgpuContext::with_config(&config.gpu)
            .await
            .map_err(|source| KernelError::Accelerator {
                op: "engine",
                source,
            })?;
        let mut engine = Self::new(config)?;
        engine.backend = BackendKind::Accelerator;
        engine.gpu = Some(Arc::new(ctx));
        Ok(engine)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn gpu(&self) -> Option<&Arc<WgpuContext>> {
        self.gpu.as_ref()
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn gradients(&self) -> &GradientRegistry {
        &self.gradients
    }

    pub fn gradients_mut(&mut self) -> &mut GradientRegistry {
        &mut self.gradients
    }

    /// Runs an operator on the configured backend.
    pub fn invoke(&self, op: Op, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<Vec<Tensor>> {
        self.invoke_on(op, self.backend, inputs, attrs)
    }

    /// Runs an operator on an explicit backend. Parity tests lean on this.
    pub fn invoke_on(
        &self,
        op: Op,
        backend: BackendKind,
        inputs: &[Tensor],
        attrs: &Attributes,
    ) -> KernelResult<Vec<Tensor>> {
        self.registry
            .invoke(op, backend, self.gpu.as_ref(), inputs, attrs)
    }

    /// Produces the lazy per-input adjoint thunks for a bound operator.
    pub fn backward(
        &self,
        name: &str,
        args: &BackwardArgs<'_>,
    ) -> KernelResult<Vec<(&'static str, GradThunk)>> {
        let binding = self.gradients.get(name)?;
        binding(args)
    }

    /// Moves a tensor to host storage. Host tensors pass through; device
    /// tensors are copied out through a staging buffer, which flushes all
    /// queued work touching them.
    pub async fn read_back(&self, tensor: &Tensor) -> KernelResult<Tensor> {
        let gpu = match tensor.data() {
            TensorData::Gpu(g) => g,
            _ => return Ok(tensor.clone()),
        };
        let wrap = |source: anyhow::Error| KernelError::Accelerator {
            op: "read_back",
            source,
        };
        match gpu.dtype() {
            DType::F32 => Ok(Tensor::from_f32(gpu.to_array_f32().await.map_err(wrap)?)),
            DType::I32 => Ok(Tensor::from_i32(gpu.to_array_i32().await.map_err(wrap)?)),
            DType::PackedF16 => {
                let lanes = gpu.to_lanes_u32().await.map_err(wrap)?;
                let logical_last = gpu.shape().last().copied().unwrap_or(0);
                Tensor::from_packed(lanes, logical_last)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn dispatches_to_the_configured_backend() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        assert_eq!(engine.backend(), BackendKind::Vectorized);
        let a: Tensor = Array2::from_shape_vec((1, 2), vec![1.0f32, 2.0]).unwrap().into();
        let b: Tensor = Array2::from_shape_vec((1, 2), vec![3.0f32, 4.0]).unwrap().into();
        let out = engine.invoke(Op::Add, &[a, b], &Attributes::new()).unwrap();
        assert_eq!(out[0].as_f32().unwrap().as_slice().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn accelerator_without_device_is_an_error() {
        let cfg = EngineConfig {
            backend: BackendKind::Accelerator,
            ..Default::default()
        };
        let engine = Engine::new(cfg).unwrap();
        let a: Tensor = Array2::from_shape_vec((1, 2), vec![1.0f32, 2.0]).unwrap().into();
        let b: Tensor = Array2::from_shape_vec((1, 2), vec![3.0f32, 4.0]).unwrap().into();
        let err = engine.invoke(Op::Add, &[a, b], &Attributes::new()).unwrap_err();
        assert!(matches!(err, KernelError::ContractViolation { .. }));
    }

    #[tokio::test]
    async fn read_back_passes_host_tensors_through() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let a: Tensor = Array2::from_shape_vec((1, 2), vec![1.0f32, 2.0]).unwrap().into();
        let back = engine.read_back(&a).await.unwrap();
        assert_eq!(back.as_f32().unwrap(), a.as_f32().unwrap());
    }
}
