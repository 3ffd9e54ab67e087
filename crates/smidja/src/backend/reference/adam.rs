//! Adam moment update and parameter adjustment.
//!
//! The (m1, m2) moment pair for each parameter lives packed, one u32 lane
//! per parameter, and both kernels work on the lanes directly instead of
//! widening the whole moment tensor.

use ndarray::{ArrayD, IxDyn};

use crate::error::{KernelError, KernelResult};
use crate::ops::Attributes;
use crate::packed::{pack_lane, unpack_lane};
use crate::registry::KernelCtx;
use crate::tensor::Tensor;

/// `m1' = β1·m1 + (1−β1)·clip(g)`, `m2' = β2·m2 + (1−β2)·clip(g)²`.
/// Gradients are clipped to [-1, 1] before mixing; that clip is part of
/// the operator contract, not a tunable.
pub(crate) fn adam_moments(
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
    let mut out = Vec::with_capacity(lanes.len());
    for (lane, g) in lanes_std.iter().zip(grad_std.iter()) {
        let (m1, m2) = unpack_lane(*lane);
        let g = g.clamp(-1.0, 1.0);
        let m1 = beta1 * m1 + (1.0 - beta1) * g;
        let m2 = beta2 * m2 + (1.0 - beta2) * g * g;
        out.push(pack_lane(m1, m2));
    }

    let arr = ArrayD::from_shape_vec(IxDyn(lanes.shape()), out)
        .map_err(|e| KernelError::packing("adam_moments", e.to_string()))?;
    Ok(vec![Tensor::from_packed(arr, logical_last)?])
}

/// Bias-corrected descent step:
/// `value' = value − lr·(m1/β1)/(sqrt(m2/β2)+ε)`.
pub(crate) fn adam_adjust(
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
    let mut out = Vec::with_capacity(value.len());
    for (lane, v) in lanes_std.iter().zip(value_std.iter()) {
        let (m1, m2) = unpack_lane(*lane);
        let m1_hat = m1 / beta1;
        let m2_hat = m2 / beta2;
        out.push(v - lr * m1_hat / (m2_hat.sqrt() + epsilon));
    }

    let arr = ArrayD::from_shape_vec(IxDyn(value.shape()), out)
        .map_err(|e| KernelError::contract("adam_adjust", e.to_string()))?;
    Ok(vec![Tensor::from_f32(arr)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use crate::packed;

    fn zero_moments(n: usize) -> Tensor {
        let pairs = ArrayD::zeros(IxDyn(&[n, 2]));
        packed::pack(&pairs, 1.0).unwrap()
    }

    fn ctx() -> KernelCtx<'static> {
        KernelCtx {
            gpu: None,
            any_packed: true,
        }
    }

    #[test]
    fn moment_update_matches_textbook_adam() {
        let (beta1, beta2) = (0.99f32, 0.95f32);
        let grads = [0.5f32, -0.25, 0.125];
        let moments = zero_moments(grads.len());
        let gradient: Tensor = Array1::from_vec(grads.to_vec()).into();
        let attrs = Attributes::new().with_f32("beta1", beta1).with_f32("beta2", beta2);

        let out = adam_moments(&ctx(), &[moments, gradient], &attrs).unwrap();
        let pairs = packed::unpack(&out[0], 1.0).unwrap();
        for (i, &g) in grads.iter().enumerate() {
            let m1 = (1.0 - beta1) * g;
            let m2 = (1.0 - beta2) * g * g;
            assert_abs_diff_eq!(pairs[[i, 0]], m1, epsilon = 1e-6);
            assert_abs_diff_eq!(pairs[[i, 1]], m2, epsilon = 1e-6);
        }
    }

    #[test]
    fn gradients_are_clipped_before_mixing() {
        let moments = zero_moments(2);
        let gradient: Tensor = Array1::from_vec(vec![10.0f32, -10.0]).into();
        let attrs = Attributes::new().with_f32("beta1", 0.9).with_f32("beta2", 0.9);
        let out = adam_moments(&ctx(), &[moments, gradient], &attrs).unwrap();
        let pairs = packed::unpack(&out[0], 1.0).unwrap();
        assert_abs_diff_eq!(pairs[[0, 0]], 0.1, epsilon = 1e-3);
        assert_abs_diff_eq!(pairs[[1, 0]], -0.1, epsilon = 1e-3);
        assert_abs_diff_eq!(pairs[[0, 1]], 0.1, epsilon = 1e-3);
    }

    #[test]
    fn adjust_applies_bias_corrected_step() {
        let (beta1, beta2, eps, lr) = (0.9f32, 0.99f32, 1e-8f32, 0.1f32);
        let m1 = 0.5f32;
        let m2 = 0.25f32;
        let pairs = ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![m1, m2]).unwrap();
        let moments = packed::pack(&pairs, 1.0).unwrap();
        let value: Tensor = Array1::from_vec(vec![1.0f32]).into();
        let attrs = Attributes::new()
            .with_f32("beta1", beta1)
            .with_f32("beta2", beta2)
            .with_f32("epsilon", eps)
            .with_f32("learning_rate", lr);

        let out = adam_adjust(&ctx(), &[moments, value], &attrs).unwrap();
        let expected = 1.0 - lr * (m1 / beta1) / ((m2 / beta2).sqrt() + eps);
        assert_abs_diff_eq!(out[0].as_f32().unwrap()[[0]], expected, epsilon = 1e-3);
    }
}
