//! Central contract validation, run once per invocation before dispatch.
//!
//! Violations fail fast with a message naming the operator and the broken
//! precondition; nothing is coerced. Backend-specific constraints (e.g. the
//! head-size multiple required by the vectorized and accelerator attention
//! paths) live with the backends that impose them.

use crate::error::{KernelError, KernelResult};
use crate::ops::{Attributes, Op};
use crate::tensor::{DType, Tensor};

const MAX_RANK: usize = 4;

pub fn validate(op: Op, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<()> {
    let name = op.name();
    let expected = op.input_names().len();
    if inputs.len() != expected {
        return Err(KernelError::contract(
            name,
            format!("expected {expected} inputs, got {}", inputs.len()),
        ));
    }
    for (input, input_name) in inputs.iter().zip(op.input_names()) {
        if input.rank() > MAX_RANK {
            return Err(KernelError::contract(
                name,
                format!(
                    "input `{input_name}` has rank {} but fused kernels are limited to rank {MAX_RANK}",
                    input.rank()
                ),
            ));
        }
    }

    match op {
        Op::Pack => {
            require_float(name, "x", &inputs[0])?;
            if inputs[0].is_packed() {
                return Err(KernelError::packing(name, "input is already packed"));
            }
            Ok(())
        }
        Op::Unpack => {
            if !inputs[0].is_packed() {
                return Err(KernelError::packing(name, "input is not packed"));
            }
            Ok(())
        }
        Op::Qkv => validate_qkv(name, inputs, attrs),
        Op::Rope => validate_rope(name, inputs, attrs),
        Op::AttentionScores => validate_attention_scores(name, inputs, attrs),
        Op::FusedSoftmax => validate_fused_softmax(name, inputs, attrs),
        Op::RmsNorm => validate_rms_norm(name, inputs),
        Op::RmsNormGrad => validate_rms_norm_grad(name, inputs),
        Op::AppendCache => validate_append_cache(name, inputs, attrs),
        Op::GatherSub => validate_gather_sub(name, inputs),
        Op::ScatterSub => validate_scatter_sub(name, inputs),
        Op::AdamMoments => validate_adam_moments(name, inputs, attrs),
        Op::AdamAdjust => validate_adam_adjust(name, inputs, attrs),
        Op::Add | Op::Sub | Op::Mul => validate_binary_elementwise(name, inputs),
        Op::Sum => validate_axis_of(name, &inputs[0], attrs),
        Op::Reshape => validate_reshape(name, inputs, attrs),
        Op::Concat => validate_concat(name, inputs, attrs),
        Op::Slice => validate_slice(name, inputs, attrs),
    }
}

fn require_float(op: &'static str, input: &str, t: &Tensor) -> KernelResult<()> {
    match t.dtype() {
        DType::F32 | DType::PackedF16 => Ok(()),
        DType::I32 => Err(KernelError::contract(
            op,
            format!("input `{input}` must be floating point, got i32"),
        )),
    }
}

fn require_dense_f32(op: &'static str, input: &str, t: &Tensor) -> KernelResult<()> {
    match t.dtype() {
        DType::F32 => Ok(()),
        DType::PackedF16 => Err(KernelError::packing(
            op,
            format!("input `{input}` must be dense f32, got packed"),
        )),
        DType::I32 => Err(KernelError::contract(
            op,
            format!("input `{input}` must be dense f32, got i32"),
        )),
    }
}

fn require_rank(op: &'static str, input: &str, t: &Tensor, rank: usize) -> KernelResult<()> {
    if t.rank() != rank {
        return Err(KernelError::contract(
            op,
            format!(
                "input `{input}` must have rank {rank}, got shape {:?}",
                t.shape()
            ),
        ));
    }
    Ok(())
}

fn validate_qkv(op: &'static str, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<()> {
    let (x, kernel) = (&inputs[0], &inputs[1]);
    require_float(op, "x", x)?;
    require_float(op, "kernel", kernel)?;
    require_rank(op, "x", x, 3)?;
    require_rank(op, "kernel", kernel, 2)?;

    let (_, _, c) = x.dims3()?;
    let kshape = kernel.shape();
    if kshape[0] != c || kshape[1] != 3 * c {
        return Err(KernelError::contract(
            op,
            format!("kernel must be [{c}, {}], got {kshape:?}", 3 * c),
        ));
    }
    let heads = attrs.usize(op, "heads")?;
    if heads == 0 || c % heads != 0 {
        return Err(KernelError::contract(
            op,
            format!("hidden size {c} is not divisible by heads {heads}"),
        ));
    }
    Ok(())
}

fn validate_rope(op: &'static str, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<()> {
    let (x, sin, cos) = (&inputs[0], &inputs[1], &inputs[2]);
    require_float(op, "x", x)?;
    require_dense_f32(op, "sin", sin)?;
    require_dense_f32(op, "cos", cos)?;
    require_rank(op, "x", x, 4)?;
    require_rank(op, "sin", sin, 2)?;
    require_rank(op, "cos", cos, 2)?;

    if sin.shape() != cos.shape() {
        return Err(KernelError::contract(
            op,
            format!(
                "sin and cos tables must match, got {:?} vs {:?}",
                sin.shape(),
                cos.shape()
            ),
        ));
    }
    let (_, _, t, _) = x.dims4()?;
    let past_len = attrs.usize_or(op, "past_len", 0)?;
    let table_rows = sin.shape()[0];
    if table_rows < t + past_len {
        return Err(KernelError::contract(
            op,
            format!(
                "position table covers {table_rows} positions but t + past_len = {}",
                t + past_len
            ),
        ));
    }
    Ok(())
}

fn validate_attention_scores(
    op: &'static str,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<()> {
    let (q, k) = (&inputs[0], &inputs[1]);
    require_float(op, "q", q)?;
    require_float(op, "k", k)?;
    require_rank(op, "q", q, 4)?;
    require_rank(op, "k", k, 4)?;

    let (qb, qh, _, qd) = q.dims4()?;
    let (kb, kh, _, kd) = k.dims4()?;
    if qb != kb || qh != kh || qd != kd {
        return Err(KernelError::contract(
            op,
            format!(
                "q {:?} and k {:?} must agree on batch, heads and head dim",
                q.shape(),
                k.shape()
            ),
        ));
    }
    let scale = attrs.f32(op, "scale")?;
    if scale == 0.0 {
        return Err(KernelError::contract(op, "scale must be non-zero"));
    }
    attrs.usize_or(op, "past_len", 0)?;
    Ok(())
}

fn validate_fused_softmax(
    op: &'static str,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<()> {
    let logits = &inputs[0];
    require_float(op, "logits", logits)?;
    validate_axis_of(op, logits, attrs)?;
    let rate = attrs.f32_or(op, "dropout_rate", 0.0)?;
    if !(0.0..1.0).contains(&rate) {
        return Err(KernelError::contract(
            op,
            format!("dropout_rate must be in [0, 1), got {rate}"),
        ));
    }
    Ok(())
}

fn validate_axis_of(op: &'static str, t: &Tensor, attrs: &Attributes) -> KernelResult<()> {
    let axis = attrs.i64_or(op, "axis", -1)?;
    let rank = t.rank() as i64;
    if axis >= rank || axis < -rank {
        return Err(KernelError::contract(
            op,
            format!("axis {axis} out of range for rank {rank}"),
        ));
    }
    Ok(())
}

/// Resolves a possibly-negative axis attribute against a rank.
pub fn resolve_axis(axis: i64, rank: usize) -> usize {
    if axis < 0 {
        (rank as i64 + axis) as usize
    } else {
        axis as usize
    }
}

fn validate_rms_norm(op: &'static str, inputs: &[Tensor]) -> KernelResult<()> {
    validate_rms_norm_pair(op, &inputs[0], &inputs[1])
}

fn validate_rms_norm_pair(op: &'static str, x: &Tensor, gamma: &Tensor) -> KernelResult<()> {
    require_float(op, "x", x)?;
    require_float(op, "gamma", gamma)?;
    require_rank(op, "gamma", gamma, 1)?;
    if x.rank() < 1 {
        return Err(KernelError::contract(op, "x must have rank >= 1"));
    }
    let c = *x.shape().last().unwrap();
    if gamma.shape()[0] != c {
        return Err(KernelError::contract(
            op,
            format!("gamma has {} entries but features are {c}", gamma.shape()[0]),
        ));
    }
    Ok(())
}

fn validate_rms_norm_grad(op: &'static str, inputs: &[Tensor]) -> KernelResult<()> {
    let (dy, x, gamma) = (&inputs[0], &inputs[1], &inputs[2]);
    validate_rms_norm_pair(op, x, gamma)?;
    require_float(op, "dy", dy)?;
    if dy.shape() != x.shape() {
        return Err(KernelError::contract(
            op,
            format!(
                "dy shape {:?} must equal x shape {:?}",
                dy.shape(),
                x.shape()
            ),
        ));
    }
    Ok(())
}

fn validate_append_cache(
    op: &'static str,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<()> {
    let (cache, item) = (&inputs[0], &inputs[1]);
    require_float(op, "cache", cache)?;
    require_float(op, "item", item)?;
    require_rank(op, "cache", cache, 4)?;
    require_rank(op, "item", item, 4)?;

    let (cb, ch, ct, cd) = cache.dims4()?;
    let (ib, ih, it, id) = item.dims4()?;
    if it != 1 {
        return Err(KernelError::contract(
            op,
            format!("item must carry exactly one timestep, got {it}"),
        ));
    }
    // An empty cache has no layout to agree with yet.
    if ct != 0 && (cb != ib || ch != ih || cd != id) {
        return Err(KernelError::contract(
            op,
            format!(
                "cache {:?} and item {:?} must agree on batch, heads and head dim",
                cache.shape(),
                item.shape()
            ),
        ));
    }
    let max_size = attrs.usize(op, "max_size")?;
    if max_size == 0 {
        return Err(KernelError::contract(op, "max_size must be >= 1"));
    }
    if ct > max_size {
        return Err(KernelError::contract(
            op,
            format!("cache already holds {ct} steps, beyond max_size {max_size}"),
        ));
    }
    let past_len = attrs.usize_or(op, "past_len", 0)?;
    // Eviction shifts existing rows; it only makes sense on a full window.
    if past_len >= max_size && ct != max_size {
        return Err(KernelError::contract(
            op,
            format!("eviction at past_len {past_len} needs a full window of {max_size} steps, got {ct}"),
        ));
    }
    Ok(())
}

fn validate_gather_sub(op: &'static str, inputs: &[Tensor]) -> KernelResult<()> {
    let (values, labels, logits) = (&inputs[0], &inputs[1], &inputs[2]);
    require_float(op, "values", values)?;
    require_float(op, "logits", logits)?;
    require_rank(op, "values", values, 1)?;
    require_rank(op, "labels", labels, 1)?;
    require_rank(op, "logits", logits, 2)?;
    if labels.dtype() != DType::I32 {
        return Err(KernelError::contract(op, "labels must be i32"));
    }
    let b = values.shape()[0];
    let lshape = logits.shape();
    if labels.shape()[0] != b || lshape[0] != b {
        return Err(KernelError::contract(
            op,
            format!(
                "batch mismatch: values {b}, labels {}, logits {:?}",
                labels.shape()[0],
                lshape
            ),
        ));
    }
    check_label_range(op, labels, lshape[1])
}

fn validate_scatter_sub(op: &'static str, inputs: &[Tensor]) -> KernelResult<()> {
    let (probs, labels, dy) = (&inputs[0], &inputs[1], &inputs[2]);
    require_float(op, "probs", probs)?;
    require_float(op, "dy", dy)?;
    require_rank(op, "probs", probs, 2)?;
    require_rank(op, "labels", labels, 1)?;
    require_rank(op, "dy", dy, 1)?;
    if labels.dtype() != DType::I32 {
        return Err(KernelError::contract(op, "labels must be i32"));
    }
    let pshape = probs.shape();
    if labels.shape()[0] != pshape[0] || dy.shape()[0] != pshape[0] {
        return Err(KernelError::contract(
            op,
            format!(
                "batch mismatch: probs {:?}, labels {}, dy {}",
                pshape,
                labels.shape()[0],
                dy.shape()[0]
            ),
        ));
    }
    check_label_range(op, labels, pshape[1])
}

/// Out-of-range labels fail validation rather than being silently skipped.
/// Device-resident labels were range-checked when they were created from
/// host data.
fn check_label_range(op: &'static str, labels: &Tensor, classes: usize) -> KernelResult<()> {
    if labels.is_gpu() {
        return Ok(());
    }
    let data = labels.as_i32()?;
    for (b, &label) in data.iter().enumerate() {
        if label < 0 || label as usize >= classes {
            return Err(KernelError::contract(
                op,
                format!("label {label} at row {b} is outside [0, {classes})"),
            ));
        }
    }
    Ok(())
}

fn validate_adam_moments(
    op: &'static str,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<()> {
    let (moments, gradient) = (&inputs[0], &inputs[1]);
    validate_moment_pair(op, moments)?;
    require_dense_f32(op, "gradient", gradient)?;

    let mshape = moments.shape();
    if &mshape[..mshape.len() - 1] != gradient.shape().as_slice() {
        return Err(KernelError::contract(
            op,
            format!(
                "moments {:?} must be gradient shape {:?} plus a trailing pair axis",
                mshape,
                gradient.shape()
            ),
        ));
    }
    validate_beta(op, "beta1", attrs.f32(op, "beta1")?)?;
    validate_beta(op, "beta2", attrs.f32(op, "beta2")?)
}

fn validate_adam_adjust(
    op: &'static str,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<()> {
    let (moments, value) = (&inputs[0], &inputs[1]);
    validate_moment_pair(op, moments)?;
    require_dense_f32(op, "value", value)?;

    let mshape = moments.shape();
    if &mshape[..mshape.len() - 1] != value.shape().as_slice() {
        return Err(KernelError::contract(
            op,
            format!(
                "moments {:?} must be value shape {:?} plus a trailing pair axis",
                mshape,
                value.shape()
            ),
        ));
    }
    validate_beta(op, "beta1", attrs.f32(op, "beta1")?)?;
    validate_beta(op, "beta2", attrs.f32(op, "beta2")?)?;
    let eps = attrs.f32(op, "epsilon")?;
    if eps < 0.0 {
        return Err(KernelError::contract(
            op,
            format!("epsilon must be non-negative, got {eps}"),
        ));
    }
    attrs.f32(op, "learning_rate")?;
    Ok(())
}

/// The moment pair is one packed lane per parameter: trailing logical
/// dimension of exactly 2.
fn validate_moment_pair(op: &'static str, moments: &Tensor) -> KernelResult<()> {
    if !moments.is_packed() {
        return Err(KernelError::packing(
            op,
            "moments must be a packed (m1, m2) pair tensor",
        ));
    }
    let last = *moments.shape().last().unwrap_or(&0);
    if last != 2 {
        return Err(KernelError::contract(
            op,
            format!("moment pair axis must be 2, got {last}"),
        ));
    }
    Ok(())
}

fn validate_beta(op: &'static str, key: &str, beta: f32) -> KernelResult<()> {
    if !(0.0..=1.0).contains(&beta) {
        return Err(KernelError::contract(
            op,
            format!("{key} must be in [0, 1], got {beta}"),
        ));
    }
    Ok(())
}

fn validate_binary_elementwise(op: &'static str, inputs: &[Tensor]) -> KernelResult<()> {
    let (a, b) = (&inputs[0], &inputs[1]);
    require_float(op, "a", a)?;
    require_float(op, "b", b)?;
    if a.shape() != b.shape() {
        return Err(KernelError::contract(
            op,
            format!("shape mismatch: {:?} vs {:?}", a.shape(), b.shape()),
        ));
    }
    Ok(())
}

fn validate_reshape(op: &'static str, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<()> {
    let dims = attrs.ints(op, "dims")?;
    if dims.iter().any(|&d| d < 0) {
        return Err(KernelError::contract(op, "dims must be non-negative"));
    }
    let target: usize = dims.iter().map(|&d| d as usize).product();
    if target != inputs[0].num_elements() {
        return Err(KernelError::contract(
            op,
            format!(
                "cannot reshape {} elements into {dims:?}",
                inputs[0].num_elements()
            ),
        ));
    }
    Ok(())
}

fn validate_concat(op: &'static str, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<()> {
    let (a, b) = (&inputs[0], &inputs[1]);
    require_float(op, "a", a)?;
    require_float(op, "b", b)?;
    if a.rank() != b.rank() {
        return Err(KernelError::contract(
            op,
            format!("rank mismatch: {:?} vs {:?}", a.shape(), b.shape()),
        ));
    }
    validate_axis_of(op, a, attrs)?;
    let axis = resolve_axis(attrs.i64_or(op, "axis", -1)?, a.rank());
    for (d, (da, db)) in a.shape().iter().zip(b.shape().iter()).enumerate() {
        if d != axis && da != db {
            return Err(KernelError::contract(
                op,
                format!(
                    "shapes {:?} and {:?} differ outside the concat axis {axis}",
                    a.shape(),
                    b.shape()
                ),
            ));
        }
    }
    Ok(())
}

fn validate_slice(op: &'static str, inputs: &[Tensor], attrs: &Attributes) -> KernelResult<()> {
    let x = &inputs[0];
    require_float(op, "x", x)?;
    let offsets = attrs.ints(op, "offsets")?;
    let sizes = attrs.ints(op, "sizes")?;
    let shape = x.shape();
    if offsets.len() != shape.len() || sizes.len() != shape.len() {
        return Err(KernelError::contract(
            op,
            format!(
                "offsets/sizes must have rank {}, got {}/{}",
                shape.len(),
                offsets.len(),
                sizes.len()
            ),
        ));
    }
    for d in 0..shape.len() {
        let (off, size) = (offsets[d], sizes[d]);
        if off < 0 || size < 0 || (off + size) as usize > shape[d] {
            return Err(KernelError::contract(
                op,
                format!("slice [{off}, {}) exceeds dim {d} of {:?}", off + size, shape),
            ));
        }
    }
    Ok(())
}
