//! Vectorized backend: whole-array ndarray math with rayon fan-out over
//! the batch and head axes.
//!
//! Synchronous from the caller's view; parallelism is internal and never
//! changes results relative to the reference backend. The attention path
//! additionally requires the head dimension to be a multiple of 4 so the
//! inner dot product can run in four independent accumulators.
//!
//! The codec and shape primitives (pack/unpack, sum, reshape, concat,
//! slice) are pure layout moves with nothing to vectorize and are shared
//! with the reference backend.

use ndarray::{s, Array1, Array2, Array4, ArrayD, Axis, IxDyn};
use rayon::prelude::*;

use crate::backend::reference;
use crate::error::{KernelError, KernelResult};
use crate::kernels::{dim2, dim3, dim4, dropout};
use crate::ops::validate::resolve_axis;
use crate::ops::{Attributes, Op, RMS_NORM_EPS};
use crate::packed::{self, pack_lane, unpack_lane};
use crate::registry::{BackendKind, KernelCtx, KernelRegistry};
use crate::tensor::Tensor;

pub fn register(registry: &mut KernelRegistry) -> KernelResult<()> {
    let b = BackendKind::Vectorized;
    registry.register(Op::Pack, b, Box::new(reference::pack))?;
    registry.register(Op::Unpack, b, Box::new(reference::unpack))?;
    registry.register(Op::Qkv, b, Box::new(qkv))?;
    registry.register(Op::Rope, b, Box::new(rope))?;
    registry.register(Op::AttentionScores, b, Box::new(attention_scores))?;
    registry.register(Op::FusedSoftmax, b, Box::new(fused_softmax))?;
    registry.register(Op::RmsNorm, b, Box::new(rms_norm))?;
    registry.register(Op::RmsNormGrad, b, Box::new(rms_norm_grad))?;
    registry.register(Op::AppendCache, b, Box::new(append_cache))?;
    registry.register(Op::GatherSub, b, Box::new(gather_sub))?;
    registry.register(Op::ScatterSub, b, Box::new(scatter_sub))?;
    registry.register(Op::AdamMoments, b, Box::new(adam_moments))?;
    registry.register(Op::AdamAdjust, b, Box::new(adam_adjust))?;
    registry.register(Op::Add, b, Box::new(|c, i, a| binary(c, i, a, Op::Add)))?;
    registry.register(Op::Sub, b, Box::new(|c, i, a| binary(c, i, a, Op::Sub)))?;
    registry.register(Op::Mul, b, Box::new(|c, i, a| binary(c, i, a, Op::Mul)))?;
    registry.register(Op::Sum, b, Box::new(reference::sum))?;
    registry.register(Op::Reshape, b, Box::new(reference::reshape))?;
    registry.register(Op::Concat, b, Box::new(reference::concat))?;
    registry.register(Op::Slice, b, Box::new(reference::slice))?;
    Ok(())
}

fn binary(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
    op: Op,
) -> KernelResult<Vec<Tensor>> {
    let (a, b) = if ctx.any_packed {
        (packed::to_dense(&inputs[0])?, packed::to_dense(&inputs[1])?)
    } else {
        (inputs[0].as_f32()?.clone(), inputs[1].as_f32()?.clone())
    };
    let out = match op {
        Op::Add => &a + &b,
        Op::Sub => &a - &b,
        Op::Mul => &a * &b,
        _ => unreachable!("binary dispatch only covers add/sub/mul"),
    };
    if !ctx.any_packed {
        return Ok(vec![Tensor::from_f32(out)]);
    }
    Ok(vec![packed::like_input(out, &inputs[0])?])
}

/// One [B·T, C]×[C, 3C] matmul, then the 3C axis is viewed as
/// [part, head, head_dim] and each part is permuted into [B, H, T, Dh].
fn qkv(_ctx: &KernelCtx<'_>, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<Vec<Tensor>> {
    let heads = attrs.usize("qkv", "heads")?;
    let x = dim3("qkv", packed::to_dense(&inputs[0])?)?;
    let kernel = dim2("qkv", packed::to_dense(&inputs[1])?)?;
    let (b, t, c) = x.dim();
    let dh = c / heads;

    let x2 = x
        .into_shape_with_order((b * t, c))
        .map_err(|e| KernelError::contract("qkv", e.to_string()))?;
    let proj = x2.dot(&kernel);
    let proj = proj
        .into_shape_with_order((b, t, 3, heads, dh))
        .map_err(|e| KernelError::contract("qkv", e.to_string()))?;

    let mut outputs = Vec::with_capacity(3);
    for part in 0..3 {
        let y = proj
            .index_axis(Axis(2), part)
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned();
        outputs.push(packed::like_input(y.into_dyn(), &inputs[0])?);
    }
    Ok(outputs)
}

fn rope(_ctx: &KernelCtx<'_>, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<Vec<Tensor>> {
    let past_len = attrs.usize_or("rope", "past_len", 0)?;
    let x = dim4("rope", packed::to_dense(&inputs[0])?)?;
    let sin = dim2("rope", inputs[1].as_f32()?.clone())?;
    let cos = dim2("rope", inputs[2].as_f32()?.clone())?;
    let (_, _, t, d) = x.dim();
    let half = sin.dim().1.min(d / 2);

    let mut y = x.clone();
    for ti in 0..t {
        let pos = ti + past_len;
        let sin_row = sin.slice(s![pos, ..half]);
        let cos_row = cos.slice(s![pos, ..half]);
        let x0 = x.slice(s![.., .., ti, 0..2 * half;2]).into_owned();
        let x1 = x.slice(s![.., .., ti, 1..2 * half;2]).into_owned();
        let r0 = &x0 * &cos_row - &x1 * &sin_row;
        let r1 = &x0 * &sin_row + &x1 * &cos_row;
        y.slice_mut(s![.., .., ti, 0..2 * half;2]).assign(&r0);
        y.slice_mut(s![.., .., ti, 1..2 * half;2]).assign(&r1);
    }
    Ok(vec![packed::like_input(y.into_dyn(), &inputs[0])?])
}

fn attention_scores(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let scale = attrs.f32("attention_scores", "scale")?;
    let past_len = attrs.usize_or("attention_scores", "past_len", 0)?;
    let q = dim4("attention_scores", packed::to_dense(&inputs[0])?)?;
    let k = dim4("attention_scores", packed::to_dense(&inputs[1])?)?;
    let (b, h, t1, d) = q.dim();
    let t2 = k.dim().2;
    if d % 4 != 0 {
        return Err(KernelError::contract(
            "attention_scores",
            format!("vectorized path needs head dim divisible by 4, got {d}"),
        ));
    }

    let q_std = q.as_standard_layout();
    let k_std = k.as_standard_layout();
    let qs = q_std.as_slice().expect("standard layout has a slice");
    let ks = k_std.as_slice().expect("standard layout has a slice");

    let mut scores = Array4::<f32>::zeros((b, h, t1, t2));
    scores
        .as_slice_mut()
        .expect("freshly allocated array is contiguous")
        .par_chunks_mut(t1 * t2)
        .enumerate()
        .for_each(|(bh, chunk)| {
            let q_base = bh * t1 * d;
            let k_base = bh * t2 * d;
            for i in 0..t1 {
                let q_row = &qs[q_base + i * d..q_base + (i + 1) * d];
                for j in 0..t2 {
                    chunk[i * t2 + j] = if j > i + past_len {
                        f32::NEG_INFINITY
                    } else {
                        let k_row = &ks[k_base + j * d..k_base + (j + 1) * d];
                        dot4(q_row, k_row) * scale
                    };
                }
            }
        });
    Ok(vec![packed::like_input(scores.into_dyn(), &inputs[0])?])
}

/// Dot product in four independent accumulators; callers guarantee
/// `a.len() % 4 == 0`.
#[inline]
fn dot4(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    for (qa, kb) in a.chunks_exact(4).zip(b.chunks_exact(4)) {
        acc[0] += qa[0] * kb[0];
        acc[1] += qa[1] * kb[1];
        acc[2] += qa[2] * kb[2];
        acc[3] += qa[3] * kb[3];
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3])
}

fn fused_softmax(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let rate = attrs.f32_or("fused_softmax", "dropout_rate", 0.0)?;
    let seed = attrs.i64_or("fused_softmax", "seed", 0)? as u32;
    let x = packed::to_dense(&inputs[0])?;
    let axis = resolve_axis(attrs.i64_or("fused_softmax", "axis", -1)?, x.ndim());

    let mut y = x.as_standard_layout().into_owned();
    if axis == y.ndim() - 1 {
        // Hot path: softmax rows are contiguous, fan out over them.
        let c = *y.shape().last().unwrap_or(&1);
        y.as_slice_mut()
            .expect("standard layout has a slice")
            .par_chunks_mut(c)
            .enumerate()
            .for_each(|(row, chunk)| {
                softmax_row(chunk);
                if rate > 0.0 {
                    for (j, v) in chunk.iter_mut().enumerate() {
                        *v *= dropout::scale_at(row * c + j, seed, rate);
                    }
                }
            });
    } else {
        for mut lane in y.lanes_mut(Axis(axis)) {
            let mut buf: Vec<f32> = lane.iter().copied().collect();
            softmax_row(&mut buf);
            for (v, r) in lane.iter_mut().zip(buf) {
                *v = r;
            }
        }
        if rate > 0.0 {
            for (flat, v) in y.iter_mut().enumerate() {
                *v *= dropout::scale_at(flat, seed, rate);
            }
        }
    }
    Ok(vec![packed::like_input(y, &inputs[0])?])
}

fn softmax_row(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    if max == f32::NEG_INFINITY {
        row.fill(0.0);
        return;
    }
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv;
    }
}

fn rms_norm(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let x = packed::to_dense(&inputs[0])?;
    let gamma = packed::to_dense(&inputs[1])?;
    let gamma_std = gamma.as_standard_layout();
    let g = gamma_std.as_slice().expect("standard layout has a slice");
    let c = g.len();

    let mut y = x.as_standard_layout().into_owned();
    y.as_slice_mut()
        .expect("standard layout has a slice")
        .par_chunks_mut(c)
        .for_each(|row| {
            let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / c as f32;
            let r = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
            for (v, gj) in row.iter_mut().zip(g) {
                *v *= r * gj;
            }
        });
    Ok(vec![packed::like_input(y, &inputs[0])?])
}

fn rms_norm_grad(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let dy = packed::to_dense(&inputs[0])?;
    let x = packed::to_dense(&inputs[1])?;
    let gamma = packed::to_dense(&inputs[2])?;
    let gamma_std = gamma.as_standard_layout();
    let g = gamma_std.as_slice().expect("standard layout has a slice");
    let c = g.len();

    let dy_std = dy.as_standard_layout();
    let x_std = x.as_standard_layout();
    let dys = dy_std.as_slice().expect("standard layout has a slice");
    let xs = x_std.as_slice().expect("standard layout has a slice");

    let mut dx = ArrayD::<f32>::zeros(IxDyn(x.shape()));
    let dgamma = dx
        .as_slice_mut()
        .expect("freshly allocated array is contiguous")
        .par_chunks_mut(c)
        .enumerate()
        .fold(
            || vec![0.0f32; c],
            |mut acc, (r, dx_row)| {
                let dy_row = &dys[r * c..(r + 1) * c];
                let x_row = &xs[r * c..(r + 1) * c];
                let mean_sq = x_row.iter().map(|v| v * v).sum::<f32>() / c as f32;
                let rinv = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
                let mut dot = 0.0;
                for j in 0..c {
                    dot += dy_row[j] * g[j] * x_row[j];
                    acc[j] += dy_row[j] * x_row[j] * rinv;
                }
                let r3_over_c = rinv * rinv * rinv / c as f32;
                for j in 0..c {
                    dx_row[j] = rinv * dy_row[j] * g[j] - x_row[j] * r3_over_c * dot;
                }
                acc
            },
        )
        .reduce(
            || vec![0.0f32; c],
            |mut a, b| {
                for (av, bv) in a.iter_mut().zip(b) {
                    *av += bv;
                }
                a
            },
        );

    Ok(vec![
        packed::like_input(dx, &inputs[1])?,
        packed::like_input(Array1::from_vec(dgamma).into_dyn(), &inputs[2])?,
    ])
}

fn append_cache(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let max_size = attrs.usize("append_cache", "max_size")?;
    let past_len = attrs.usize_or("append_cache", "past_len", 0)?;
    let cache = dim4("append_cache", packed::to_dense(&inputs[0])?)?;
    let item = dim4("append_cache", packed::to_dense(&inputs[1])?)?;
    let (_, _, ct, _) = cache.dim();
    let (b, h, _, d) = item.dim();
    let item_step = item.index_axis(Axis(2), 0);

    let out = if past_len >= max_size {
        let mut out = Array4::<f32>::zeros((b, h, ct, d));
        out.slice_mut(s![.., .., ..ct - 1, ..])
            .assign(&cache.slice(s![.., .., 1.., ..]));
        out.index_axis_mut(Axis(2), ct - 1).assign(&item_step);
        out
    } else {
        let t_out = if ct == 0 {
            max_size
        } else {
            ct.max(past_len + 1).min(max_size)
        };
        let mut out = Array4::<f32>::zeros((b, h, t_out, d));
        let keep = ct.min(t_out);
        if keep > 0 {
            out.slice_mut(s![.., .., ..keep, ..])
                .assign(&cache.slice(s![.., .., ..keep, ..]));
        }
        out.index_axis_mut(Axis(2), past_len).assign(&item_step);
        out
    };
    Ok(vec![packed::like_input(out.into_dyn(), &inputs[0])?])
}

fn gather_sub(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let values = packed::to_dense(&inputs[0])?;
    let labels = inputs[1].as_i32()?;
    let logits = dim2("gather_sub", packed::to_dense(&inputs[2])?)?;

    let out: Array1<f32> = values
        .iter()
        .zip(labels.iter())
        .enumerate()
        .map(|(bi, (&value, &label))| value - logits[[bi, label as usize]])
        .collect();
    Ok(vec![packed::like_input(out.into_dyn(), &inputs[0])?])
}

fn scatter_sub(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let probs = dim2("scatter_sub", packed::to_dense(&inputs[0])?)?;
    let labels = inputs[1].as_i32()?;
    let dy = packed::to_dense(&inputs[2])?;

    let mut out = probs;
    for (bi, mut row) in out.outer_iter_mut().enumerate() {
        row[labels[[bi]] as usize] -= 1.0;
        row *= dy[[bi]];
    }
    Ok(vec![packed::like_input(out.into_dyn(), &inputs[0])?])
}

fn adam_moments(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let beta1 = attrs.f32("adam_moments", "beta1")?;
    let beta2 = attrs.f32("adam_moments", "beta2")?;
    let (lanes, logical_last) = inputs[0].as_packed()?;
    let gradient = inputs[1].as_f32()?;

    let lanes_std = lanes.as_standard_layout();
    let grad_std = gradient.as_standard_layout();
    let ls = lanes_std.as_slice().expect("standard layout has a slice");
    let gs = grad_std.as_slice().expect("standard layout has a slice");

    let out: Vec<u32> = ls
        .par_iter()
        .zip(gs.par_iter())
        .map(|(&lane, &g)| {
            let (m1, m2) = unpack_lane(lane);
            let g = g.clamp(-1.0, 1.0);
            pack_lane(beta1 * m1 + (1.0 - beta1) * g, beta2 * m2 + (1.0 - beta2) * g * g)
        })
        .collect();

    let arr = ArrayD::from_shape_vec(IxDyn(lanes.shape()), out)
        .map_err(|e| KernelError::packing("adam_moments", e.to_string()))?;
    Ok(vec![Tensor::from_packed(arr, logical_last)?])
}

fn adam_adjust(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let beta1 = attrs.f32("adam_adjust", "beta1")?;
    let beta2 = attrs.f32("adam_adjust", "beta2")?;
    let epsilon = attrs.f32("adam_adjust", "epsilon")?;
    let lr = attrs.f32("adam_adjust", "learning_rate")?;
    let (lanes, _) = inputs[0].as_packed()?;
    let value = inputs[1].as_f32()?;

    let lanes_std = lanes.as_standard_layout();
    let value_std = value.as_standard_layout();
    let ls = lanes_std.as_slice().expect("standard layout has a slice");
    let vs = value_std.as_slice().expect("standard layout has a slice");

    let out: Vec<f32> = ls
        .par_iter()
        .zip(vs.par_iter())
        .map(|(&lane, &v)| {
            let (m1, m2) = unpack_lane(lane);
            v - lr * (m1 / beta1) / ((m2 / beta2).sqrt() + epsilon)
        })
        .collect();

    let arr = ArrayD::from_shape_vec(IxDyn(value.shape()), out)
        .map_err(|e| KernelError::contract("adam_adjust", e.to_string()))?;
    Ok(vec![Tensor::from_f32(arr)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    use crate::backend::reference;

    fn ctx() -> KernelCtx<'static> {
        KernelCtx {
            gpu: None,
            any_packed: false,
        }
    }

    fn assert_close(a: &Tensor, b: &Tensor, eps: f32) {
        let (a, b) = (a.as_f32().unwrap(), b.as_f32().unwrap());
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            if x.is_infinite() || y.is_infinite() {
                assert_eq!(x, y);
            } else {
                assert_abs_diff_eq!(x, y, epsilon = eps);
            }
        }
    }

    #[test]
    fn qkv_matches_reference() {
        let x: Tensor = Array3::random((2, 3, 8), Uniform::new(-1.0f32, 1.0)).into();
        let kernel: Tensor = Array2::random((8, 24), Uniform::new(-1.0f32, 1.0)).into();
        let attrs = Attributes::new().with_i64("heads", 2);
        let fast = qkv(&ctx(), &[x.clone(), kernel.clone()], &attrs).unwrap();
        let slow = reference_qkv(&[x, kernel], &attrs);
        for (f, s) in fast.iter().zip(slow.iter()) {
            assert_close(f, s, 1e-5);
        }
    }

    fn reference_qkv(inputs: &[Tensor], attrs: &Attributes) -> Vec<Tensor> {
        let mut reg = KernelRegistry::new();
        reference::register(&mut reg).unwrap();
        reg.invoke(Op::Qkv, BackendKind::Reference, None, inputs, attrs)
            .unwrap()
    }

    #[test]
    fn attention_requires_head_dim_multiple_of_4() {
        let q: Tensor = Array4::<f32>::zeros((1, 1, 2, 6)).into();
        let k: Tensor = Array4::<f32>::zeros((1, 1, 2, 6)).into();
        let attrs = Attributes::new().with_f32("scale", 1.0);
        let err = attention_scores(&ctx(), &[q, k], &attrs).unwrap_err();
        assert!(matches!(err, KernelError::ContractViolation { .. }));
    }

    #[test]
    fn attention_matches_reference() {
        let mut reg = KernelRegistry::new();
        reference::register(&mut reg).unwrap();
        let q: Tensor = Array4::random((2, 2, 4, 8), Uniform::new(-1.0f32, 1.0)).into();
        let k: Tensor = Array4::random((2, 2, 4, 8), Uniform::new(-1.0f32, 1.0)).into();
        let attrs = Attributes::new().with_f32("scale", 0.35);
        let fast = attention_scores(&ctx(), &[q.clone(), k.clone()], &attrs).unwrap();
        let slow = reg
            .invoke(Op::AttentionScores, BackendKind::Reference, None, &[q, k], &attrs)
            .unwrap();
        assert_close(&fast[0], &slow[0], 1e-5);
    }

    #[test]
    fn softmax_dropout_mask_matches_reference() {
        let mut reg = KernelRegistry::new();
        reference::register(&mut reg).unwrap();
        let x: Tensor = Array2::random((6, 10), Uniform::new(-2.0f32, 2.0)).into();
        let attrs = Attributes::new()
            .with_f32("dropout_rate", 0.3)
            .with_i64("seed", 99);
        let fast = fused_softmax(&ctx(), &[x.clone()], &attrs).unwrap();
        let slow = reg
            .invoke(Op::FusedSoftmax, BackendKind::Reference, None, &[x], &attrs)
            .unwrap();
        assert_close(&fast[0], &slow[0], 1e-6);
    }

    #[test]
    fn rms_norm_grad_matches_reference() {
        let mut reg = KernelRegistry::new();
        reference::register(&mut reg).unwrap();
        let dy: Tensor = Array3::random((2, 3, 8), Uniform::new(-1.0f32, 1.0)).into();
        let x: Tensor = Array3::random((2, 3, 8), Uniform::new(-1.0f32, 1.0)).into();
        let gamma: Tensor = Array1::random(8, Uniform::new(0.5f32, 1.5)).into();
        let fast = rms_norm_grad(&ctx(), &[dy.clone(), x.clone(), gamma.clone()], &Attributes::new())
            .unwrap();
        let slow = reg
            .invoke(
                Op::RmsNormGrad,
                BackendKind::Reference,
                None,
                &[dy, x, gamma],
                &Attributes::new(),
            )
            .unwrap();
        assert_close(&fast[0], &slow[0], 1e-5);
        assert_close(&fast[1], &slow[1], 1e-4);
    }
}
