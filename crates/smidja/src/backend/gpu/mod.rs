//! Accelerator backend: asynchronous wgpu compute-shader dispatch.
//!
//! Kernels enqueue work and return device handles immediately; host data
//! materializes only at the engine's explicit readback point. Shape
//! primitives (sum/reshape/concat/slice) and the codec stay host-side;
//! dispatch reports them as `MissingKernel` on this backend rather than
//! silently falling back.

pub mod context;
mod kernels;
mod shaders;
pub mod tensor;

pub use context::{GpuConfig, PowerPref, WgpuContext};
pub use tensor::GpuTensor;

use crate::error::KernelResult;
use crate::ops::Op;
use crate::registry::{BackendKind, KernelRegistry};

pub fn register(registry: &mut KernelRegistry) -> KernelResult<()> {
    let b = BackendKind::Accelerator;
    registry.register(Op::Qkv, b, Box::new(kernels::qkv))?;
    registry.register(Op::Rope, b, Box::new(kernels::rope))?;
    registry.register(Op::AttentionScores, b, Box::new(kernels::attention_scores))?;
    registry.register(Op::FusedSoftmax, b, Box::new(kernels::fused_softmax))?;
    registry.register(Op::RmsNorm, b, Box::new(kernels::rms_norm))?;
    registry.register(Op::RmsNormGrad, b, Box::new(kernels::rms_norm_grad))?;
    registry.register(Op::AppendCache, b, Box::new(kernels::append_cache))?;
    registry.register(Op::GatherSub, b, Box::new(kernels::gather_sub))?;
    registry.register(Op::ScatterSub, b, Box::new(kernels::scatter_sub))?;
    registry.register(Op::AdamMoments, b, Box::new(kernels::adam_moments))?;
    registry.register(Op::AdamAdjust, b, Box::new(kernels::adam_adjust))?;
    registry.register(Op::Add, b, Box::new(|c, i, a| kernels::binary(c, i, a, "add", '+')))?;
    registry.register(Op::Sub, b, Box::new(|c, i, a| kernels::binary(c, i, a, "sub", '-')))?;
    registry.register(Op::Mul, b, Box::new(|c, i, a| kernels::binary(c, i, a, "mul", '*')))?;
    Ok(())
}
