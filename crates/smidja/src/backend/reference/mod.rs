//! Reference backend: scalar, synchronous, full precision.
//!
//! Every operator is written as plain index loops with no batching, no
//! threads and no fusion tricks beyond what the contract demands. This is
//! the correctness baseline the vectorized and accelerator backends are
//! tested against. Packed operands are widened to f32 on entry and the
//! output mirrors the first input's packing state; only the Adam kernels
//! work on the packed lanes natively, since the moment pair is defined to
//! live packed.

mod adam;
mod transformer;

use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice};

use crate::error::{KernelError, KernelResult};
use crate::ops::validate::resolve_axis;
use crate::ops::{Attributes, Op};
use crate::packed;
use crate::registry::{BackendKind, KernelCtx, KernelRegistry};
use crate::tensor::Tensor;

/// Registers every reference implementation. Called once at engine
/// construction.
pub fn register(registry: &mut KernelRegistry) -> KernelResult<()> {
    let b = BackendKind::Reference;
    registry.register(Op::Pack, b, Box::new(pack))?;
    registry.register(Op::Unpack, b, Box::new(unpack))?;
    registry.register(Op::Qkv, b, Box::new(transformer::qkv))?;
    registry.register(Op::Rope, b, Box::new(transformer::rope))?;
    registry.register(Op::AttentionScores, b, Box::new(transformer::attention_scores))?;
    registry.register(Op::FusedSoftmax, b, Box::new(transformer::fused_softmax))?;
    registry.register(Op::RmsNorm, b, Box::new(transformer::rms_norm))?;
    registry.register(Op::RmsNormGrad, b, Box::new(transformer::rms_norm_grad))?;
    registry.register(Op::AppendCache, b, Box::new(transformer::append_cache))?;
    registry.register(Op::GatherSub, b, Box::new(transformer::gather_sub))?;
    registry.register(Op::ScatterSub, b, Box::new(transformer::scatter_sub))?;
    registry.register(Op::AdamMoments, b, Box::new(adam::adam_moments))?;
    registry.register(Op::AdamAdjust, b, Box::new(adam::adam_adjust))?;
    registry.register(Op::Add, b, Box::new(|c, i, a| binary(c, i, a, |x, y| x + y)))?;
    registry.register(Op::Sub, b, Box::new(|c, i, a| binary(c, i, a, |x, y| x - y)))?;
    registry.register(Op::Mul, b, Box::new(|c, i, a| binary(c, i, a, |x, y| x * y)))?;
    registry.register(Op::Sum, b, Box::new(sum))?;
    registry.register(Op::Reshape, b, Box::new(reshape))?;
    registry.register(Op::Concat, b, Box::new(concat))?;
    registry.register(Op::Slice, b, Box::new(slice))?;
    Ok(())
}

pub(crate) fn pack(_ctx: &KernelCtx<'_>, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<Vec<Tensor>> {
    let scale = attrs.f32_or("pack", "scale", 1.0)?;
    Ok(vec![packed::pack(inputs[0].as_f32()?, scale)?])
}

pub(crate) fn unpack(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let scale = attrs.f32_or("unpack", "scale", 1.0)?;
    Ok(vec![Tensor::from_f32(packed::unpack(&inputs[0], scale)?)])
}

fn binary(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
    f: impl Fn(f32, f32) -> f32,
) -> KernelResult<Vec<Tensor>> {
    // All-dense operands skip the codec round trip entirely.
    if !ctx.any_packed {
        let mut out = inputs[0].as_f32()?.clone();
        out.zip_mut_with(inputs[1].as_f32()?, |x, &y| *x = f(*x, y));
        return Ok(vec![Tensor::from_f32(out)]);
    }
    let a = packed::to_dense(&inputs[0])?;
    let b = packed::to_dense(&inputs[1])?;
    let mut out = a;
    out.zip_mut_with(&b, |x, &y| *x = f(*x, y));
    Ok(vec![packed::like_input(out, &inputs[0])?])
}

pub(crate) fn sum(_ctx: &KernelCtx<'_>, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<Vec<Tensor>> {
    let x = packed::to_dense(&inputs[0])?;
    let axis = resolve_axis(attrs.i64_or("sum", "axis", -1)?, x.ndim());
    let out = x.sum_axis(Axis(axis));
    Ok(vec![packed::like_input(out, &inputs[0])?])
}

pub(crate) fn reshape(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let dims: Vec<usize> = attrs
        .ints("reshape", "dims")?
        .iter()
        .map(|&d| d as usize)
        .collect();
    let x = packed::to_dense(&inputs[0])?;
    let out = x
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(&dims))
        .map_err(|e| KernelError::contract("reshape", e.to_string()))?;
    Ok(vec![packed::like_input(out, &inputs[0])?])
}

pub(crate) fn concat(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let a = packed::to_dense(&inputs[0])?;
    let b = packed::to_dense(&inputs[1])?;
    let axis = resolve_axis(attrs.i64_or("concat", "axis", -1)?, a.ndim());
    let out: ArrayD<f32> = concatenate(Axis(axis), &[a.view(), b.view()])
        .map_err(|e| KernelError::contract("concat", e.to_string()))?;
    Ok(vec![packed::like_input(out, &inputs[0])?])
}

pub(crate) fn slice(_ctx: &KernelCtx<'_>, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<Vec<Tensor>> {
    let offsets = attrs.ints("slice", "offsets")?.to_vec();
    let sizes = attrs.ints("slice", "sizes")?.to_vec();
    let x = packed::to_dense(&inputs[0])?;
    let out = x
        .slice_each_axis(|ax| {
            let d = ax.axis.index();
            Slice::new(offsets[d] as isize, Some((offsets[d] + sizes[d]) as isize), 1)
        })
        .to_owned();
    Ok(vec![packed::like_input(out, &inputs[0])?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn ctx() -> KernelCtx<'static> {
        KernelCtx {
            gpu: None,
            any_packed: false,
        }
    }

    #[test]
    fn elementwise_binary_ops() {
        let a: Tensor = Array1::from_vec(vec![1.0f32, 2.0, 3.0]).into();
        let b: Tensor = Array1::from_vec(vec![10.0f32, 20.0, 30.0]).into();
        let out = binary(&ctx(), &[a, b], &Attributes::new(), |x, y| x + y).unwrap();
        let out = out[0].as_f32().unwrap();
        assert_eq!(out.as_slice().unwrap(), &[11.0, 22.0, 33.0]);
    }

    #[test]
    fn sum_reduces_the_requested_axis() {
        let x: Tensor = Array2::from_shape_vec((2, 3), vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap()
            .into();
        let attrs = Attributes::new().with_i64("axis", 0);
        let out = sum(&ctx(), &[x], &attrs).unwrap();
        assert_eq!(out[0].as_f32().unwrap().as_slice().unwrap(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn slice_extracts_a_window() {
        let x: Tensor = Array2::from_shape_vec((2, 4), (0..8).map(|v| v as f32).collect())
            .unwrap()
            .into();
        let attrs = Attributes::new()
            .with_ints("offsets", vec![1, 1])
            .with_ints("sizes", vec![1, 2]);
        let out = slice(&ctx(), &[x], &attrs).unwrap();
        assert_eq!(out[0].shape(), vec![1, 2]);
        assert_eq!(out[0].as_f32().unwrap().as_slice().unwrap(), &[5.0, 6.0]);
    }

    #[test]
    fn packed_operands_round_through_the_codec() {
        let a = Array2::from_shape_vec((2, 4), vec![1.0f32; 8]).unwrap().into_dyn();
        let packed_a = packed::pack(&a, 1.0).unwrap();
        let b: Tensor = Array2::from_shape_vec((2, 4), vec![2.0f32; 8]).unwrap().into();
        // dispatch marks the context packed when any operand is
        let ctx = KernelCtx {
            gpu: None,
            any_packed: true,
        };
        let out = binary(&ctx, &[packed_a, b], &Attributes::new(), |x, y| x * y).unwrap();
        assert!(out[0].is_packed());
        let dense = packed::unpack(&out[0], 1.0).unwrap();
        assert!(dense.iter().all(|&v| v == 2.0));
    }
}
