//! Scalar implementations of the fused transformer operators.

use ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::error::KernelResult;
use crate::kernels::{dim2, dim3, dim4, dropout};
use crate::ops::validate::resolve_axis;
use crate::ops::{Attributes, RMS_NORM_EPS};
use crate::packed;
use crate::registry::KernelCtx;
use crate::tensor::Tensor;

/// Fused projection: `x · kernel`, split into q/k/v and laid out per head.
pub(crate) fn qkv(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let heads = attrs.usize("qkv", "heads")?;
    let x = dim3("qkv", packed::to_dense(&inputs[0])?)?;
    let kernel = dim2("qkv", packed::to_dense(&inputs[1])?)?;
    let (b, t, c) = x.dim();
    let dh = c / heads;

    let mut proj = Array3::<f32>::zeros((b, t, 3 * c));
    for bi in 0..b {
        for ti in 0..t {
            for j in 0..3 * c {
                let mut acc = 0.0;
                for ci in 0..c {
                    acc += x[[bi, ti, ci]] * kernel[[ci, j]];
                }
                proj[[bi, ti, j]] = acc;
            }
        }
    }

    let mut outputs = Vec::with_capacity(3);
    for part in 0..3 {
        let mut y = Array4::<f32>::zeros((b, heads, t, dh));
        for bi in 0..b {
            for hi in 0..heads {
                for ti in 0..t {
                    for di in 0..dh {
                        y[[bi, hi, ti, di]] = proj[[bi, ti, part * c + hi * dh + di]];
                    }
                }
            }
        }
        outputs.push(packed::like_input(y.into_dyn(), &inputs[0])?);
    }
    Ok(outputs)
}

/// Rotates each adjacent coordinate pair of the rotary prefix by the angle
/// at absolute position `t + past_len`; dimensions beyond the rotary width
/// pass through unchanged.
pub(crate) fn rope(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let past_len = attrs.usize_or("rope", "past_len", 0)?;
    let x = dim4("rope", packed::to_dense(&inputs[0])?)?;
    let sin = dim2("rope", inputs[1].as_f32()?.clone())?;
    let cos = dim2("rope", inputs[2].as_f32()?.clone())?;
    let (b, h, t, d) = x.dim();
    let half = sin.dim().1.min(d / 2);

    let mut y = x.clone();
    for bi in 0..b {
        for hi in 0..h {
            for ti in 0..t {
                let pos = ti + past_len;
                for i in 0..half {
                    let (c, s) = (cos[[pos, i]], sin[[pos, i]]);
                    let x0 = x[[bi, hi, ti, 2 * i]];
                    let x1 = x[[bi, hi, ti, 2 * i + 1]];
                    y[[bi, hi, ti, 2 * i]] = x0 * c - x1 * s;
                    y[[bi, hi, ti, 2 * i + 1]] = x0 * s + x1 * c;
                }
            }
        }
    }
    Ok(vec![packed::like_input(y.into_dyn(), &inputs[0])?])
}

/// Scaled dot-product scores with the causal mask folded in: any key
/// position beyond `query + past_len` is negative infinity so the softmax
/// zeroes it.
pub(crate) fn attention_scores(
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

    let mut scores = Array4::<f32>::zeros((b, h, t1, t2));
    for bi in 0..b {
        for hi in 0..h {
            for i in 0..t1 {
                for j in 0..t2 {
                    scores[[bi, hi, i, j]] = if j > i + past_len {
                        f32::NEG_INFINITY
                    } else {
                        let mut acc = 0.0;
                        for di in 0..d {
                            acc += q[[bi, hi, i, di]] * k[[bi, hi, j, di]];
                        }
                        acc * scale
                    };
                }
            }
        }
    }
    Ok(vec![packed::like_input(scores.into_dyn(), &inputs[0])?])
}

/// Numerically-stable softmax with deterministic inverted dropout. The
/// dropout mask is a function of each element's row-major offset and the
/// seed, so the backward pass regenerates it instead of storing it.
pub(crate) fn fused_softmax(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let rate = attrs.f32_or("fused_softmax", "dropout_rate", 0.0)?;
    let seed = attrs.i64_or("fused_softmax", "seed", 0)? as u32;
    let mut y = packed::to_dense(&inputs[0])?;
    let axis = resolve_axis(attrs.i64_or("fused_softmax", "axis", -1)?, y.ndim());

    for mut lane in y.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        // A fully masked row normalizes to zero probability everywhere.
        if max == f32::NEG_INFINITY {
            lane.fill(0.0);
            continue;
        }
        let mut sum = 0.0;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }

    if rate > 0.0 {
        // iteration runs in logical order, so enumerate yields the
        // row-major offset the mask is keyed by
        for (flat, v) in y.iter_mut().enumerate() {
            *v *= dropout::scale_at(flat, seed, rate);
        }
    }
    Ok(vec![packed::like_input(y, &inputs[0])?])
}

pub(crate) fn rms_norm(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let x = packed::to_dense(&inputs[0])?;
    let gamma = packed::to_dense(&inputs[1])?;
    let c = *x.shape().last().unwrap_or(&0);
    let last = Axis(x.ndim() - 1);

    let mut y = x.clone();
    for mut lane in y.lanes_mut(last) {
        let mean_sq = lane.iter().map(|v| v * v).sum::<f32>() / c as f32;
        let r = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
        for (j, v) in lane.iter_mut().enumerate() {
            *v *= r * gamma[j];
        }
    }
    Ok(vec![packed::like_input(y, &inputs[0])?])
}

/// Closed-form RMSNorm adjoint. With `r = rsqrt(mean(x²)+ε)`:
///   dγ_j = Σ dy_j · x_j · r
///   dx_j = r·dy_j·γ_j − (x_j·r³/C)·Σ_i dy_i·γ_i·x_i
pub(crate) fn rms_norm_grad(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let dy = packed::to_dense(&inputs[0])?;
    let x = packed::to_dense(&inputs[1])?;
    let gamma = packed::to_dense(&inputs[2])?;
    let c = *x.shape().last().unwrap_or(&0);
    let last = Axis(x.ndim() - 1);

    let mut dx = x.clone();
    let mut dgamma = vec![0.0f32; c];
    for ((dy_lane, x_lane), mut dx_lane) in dy
        .lanes(last)
        .into_iter()
        .zip(x.lanes(last))
        .zip(dx.lanes_mut(last))
    {
        let mean_sq = x_lane.iter().map(|v| v * v).sum::<f32>() / c as f32;
        let r = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
        let mut dot = 0.0;
        for j in 0..c {
            dot += dy_lane[j] * gamma[j] * x_lane[j];
            dgamma[j] += dy_lane[j] * x_lane[j] * r;
        }
        let r3_over_c = r * r * r / c as f32;
        for j in 0..c {
            dx_lane[j] = r * dy_lane[j] * gamma[j] - x_lane[j] * r3_over_c * dot;
        }
    }

    Ok(vec![
        packed::like_input(dx, &inputs[1])?,
        packed::like_input(Array1::from_vec(dgamma).into_dyn(), &inputs[2])?,
    ])
}

/// Sliding-window append. Writes the new timestep at `past_len`; a full
/// window evicts the oldest entry instead. Always returns a new tensor,
/// never grows in place.
pub(crate) fn append_cache(
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

    let out = if past_len >= max_size {
        // Window is full: evict the oldest timestep, append at the end.
        let mut out = Array4::<f32>::zeros((b, h, ct, d));
        for bi in 0..b {
            for hi in 0..h {
                for ti in 0..ct - 1 {
                    for di in 0..d {
                        out[[bi, hi, ti, di]] = cache[[bi, hi, ti + 1, di]];
                    }
                }
                for di in 0..d {
                    out[[bi, hi, ct - 1, di]] = item[[bi, hi, 0, di]];
                }
            }
        }
        out
    } else {
        let t_out = if ct == 0 {
            max_size
        } else {
            ct.max(past_len + 1).min(max_size)
        };
        let mut out = Array4::<f32>::zeros((b, h, t_out, d));
        for bi in 0..b {
            for hi in 0..h {
                for ti in 0..ct.min(t_out) {
                    for di in 0..d {
                        out[[bi, hi, ti, di]] = cache[[bi, hi, ti, di]];
                    }
                }
                for di in 0..d {
                    out[[bi, hi, past_len, di]] = item[[bi, hi, 0, di]];
                }
            }
        }
        out
    };
    Ok(vec![packed::like_input(out.into_dyn(), &inputs[0])?])
}

/// `out[b] = values[b] − logits[b, labels[b]]`: turns a log-sum-exp value
/// into a per-example negative log-likelihood without a one-hot matrix.
pub(crate) fn gather_sub(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let values = packed::to_dense(&inputs[0])?;
    let labels = inputs[1].as_i32()?;
    let logits = dim2("gather_sub", packed::to_dense(&inputs[2])?)?;

    let b = values.len();
    let mut out = Array1::<f32>::zeros(b);
    for (bi, (&value, &label)) in values.iter().zip(labels.iter()).enumerate() {
        out[bi] = value - logits[[bi, label as usize]];
    }
    Ok(vec![packed::like_input(out.into_dyn(), &inputs[0])?])
}

/// `out[b,k] = (probs[b,k] − 1{k=labels[b]}) · dy[b]`: the softmax
/// cross-entropy gradient without one-hot expansion.
pub(crate) fn scatter_sub(
    _ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let probs = dim2("scatter_sub", packed::to_dense(&inputs[0])?)?;
    let labels = inputs[1].as_i32()?;
    let dy = packed::to_dense(&inputs[2])?;
    let (b, k) = probs.dim();

    let mut out = Array2::<f32>::zeros((b, k));
    for bi in 0..b {
        let label = labels[[bi]] as usize;
        let g = dy[[bi]];
        for ki in 0..k {
            let indicator = if ki == label { 1.0 } else { 0.0 };
            out[[bi, ki]] = (probs[[bi, ki]] - indicator) * g;
        }
    }
    Ok(vec![packed::like_input(out.into_dyn(), &inputs[0])?])
}
