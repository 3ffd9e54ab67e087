//! Fused transformer kernels behind one operator contract
//!
//! Smiðja ships the fused primitives a GPT-style training and inference
//! stack needs (QKV projection, rotary embeddings, masked attention
//! scores, softmax+dropout, RMSNorm and its gradient, KV-cache append,
//! sparse cross-entropy gather/scatter, Adam) on three interchangeable
//! backends: a scalar reference, an ndarray/rayon vectorized backend and
//! a wgpu compute-shader accelerator. Tensors carry an optional packed
//! half-precision layout (two f16 per u32 lane) end to end.

pub mod autograd;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod ops;
pub mod packed;
pub mod registry;
pub mod tensor;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use crate::{
    autograd::{BackwardArgs, BackwardFn, GradThunk, GradientRegistry},
    config::EngineConfig,
    engine::Engine,
    error::{KernelError, KernelResult},
    ops::{AttrValue, Attributes, Op},
    registry::{BackendKind, KernelCtx, KernelFn, KernelRegistry},
    tensor::{DType, Tensor, TensorData},
};
pub use backend::gpu::{GpuConfig, GpuTensor, PowerPref, WgpuContext};
