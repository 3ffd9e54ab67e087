//! Accelerator parity against the scalar reference. Every test bails out
//! quietly when the host exposes no wgpu adapter, so CI without a GPU
//! still runs the rest of the suite.

use ndarray::Array1;

use crate::ops::{Attributes, Op};
use crate::registry::BackendKind::{Accelerator, Reference};
use crate::tensor::Tensor;

use super::common::{
    accelerator_engine, assert_close_after_readback, random, random_packed, run,
};

const TOL: f32 = 1e-4;
// packed results round through f16 twice
const PACKED_TOL: f32 = 1e-2;

async fn parity(op: Op, inputs: &[Tensor], attrs: &Attributes, tol: f32, label: &str) {
    let Some(engine) = accelerator_engine().await else {
        return;
    };
    let want = run(&engine, op, Reference, inputs, attrs);
    let got = run(&engine, op, Accelerator, inputs, attrs);
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want.iter()).enumerate() {
        assert_close_after_readback(&engine, g, w, tol, &format!("{label}[{i}]")).await;
    }
}

#[tokio::test]
async fn qkv_parity() {
    let x = random(&[2, 3, 8], -1.0, 1.0);
    let kernel = random(&[8, 24], -0.5, 0.5);
    parity(
        Op::Qkv,
        &[x, kernel],
        &Attributes::new().with_i64("heads", 2),
        TOL,
        "gpu qkv",
    )
    .await;
}

#[tokio::test]
async fn rope_parity_dense_and_packed() {
    let sin: Tensor = ndarray::Array2::from_shape_fn((8, 4), |(p, i)| ((p + i) as f32).sin()).into();
    let cos: Tensor = ndarray::Array2::from_shape_fn((8, 4), |(p, i)| ((p + i) as f32).cos()).into();
    let attrs = Attributes::new().with_i64("past_len", 2);

    let x = random(&[1, 2, 4, 8], -1.0, 1.0);
    parity(Op::Rope, &[x, sin.clone(), cos.clone()], &attrs, TOL, "gpu rope").await;

    let xp = random_packed(&[1, 2, 4, 8], -1.0, 1.0);
    parity(Op::Rope, &[xp, sin, cos], &attrs, PACKED_TOL, "gpu rope packed").await;
}

#[tokio::test]
async fn attention_scores_parity() {
    let q = random(&[2, 2, 5, 8], -1.0, 1.0);
    let k = random(&[2, 2, 5, 8], -1.0, 1.0);
    let attrs = Attributes::new().with_f32("scale", 0.35).with_i64("past_len", 1);
    parity(Op::AttentionScores, &[q, k], &attrs, TOL, "gpu attention").await;
}

#[tokio::test]
async fn fused_softmax_parity_with_dropout() {
    let x = random(&[3, 4, 16], -4.0, 4.0);
    let attrs = Attributes::new()
        .with_f32("dropout_rate", 0.4)
        .with_i64("seed", 3);
    parity(Op::FusedSoftmax, &[x], &attrs, TOL, "gpu softmax").await;

    let xp = random_packed(&[4, 16], -2.0, 2.0);
    parity(
        Op::FusedSoftmax,
        &[xp],
        &Attributes::new(),
        PACKED_TOL,
        "gpu softmax packed",
    )
    .await;
}

#[tokio::test]
async fn rms_norm_parity() {
    let x = random(&[2, 3, 16], -2.0, 2.0);
    let gamma = random(&[16], 0.5, 1.5);
    parity(Op::RmsNorm, &[x, gamma], &Attributes::new(), TOL, "gpu rms_norm").await;
}

#[tokio::test]
async fn rms_norm_grad_parity() {
    let dy = random(&[6, 8], -1.0, 1.0);
    let x = random(&[6, 8], -2.0, 2.0);
    let gamma = random(&[8], 0.5, 1.5);
    parity(
        Op::RmsNormGrad,
        &[dy, x, gamma],
        &Attributes::new(),
        TOL,
        "gpu rms_norm_grad",
    )
    .await;
}

#[tokio::test]
async fn append_cache_parity_dense_and_packed() {
    let cache = random(&[1, 2, 3, 4], -1.0, 1.0);
    let item = random(&[1, 2, 1, 4], -1.0, 1.0);
    let attrs = Attributes::new().with_i64("max_size", 6).with_i64("past_len", 3);
    parity(Op::AppendCache, &[cache, item], &attrs, TOL, "gpu cache").await;

    let cache = random_packed(&[1, 2, 4, 4], -1.0, 1.0);
    let item = random_packed(&[1, 2, 1, 4], -1.0, 1.0);
    let attrs = Attributes::new().with_i64("max_size", 4).with_i64("past_len", 4);
    // packed cache rows move as whole lanes, so parity is exact
    parity(Op::AppendCache, &[cache, item], &attrs, TOL, "gpu cache packed").await;
}

#[tokio::test]
async fn gather_and_scatter_parity() {
    let values = random(&[4], 0.0, 5.0);
    let labels: Tensor = Array1::from_vec(vec![0i32, 2, 1, 2]).into();
    let logits = random(&[4, 3], -2.0, 2.0);
    parity(
        Op::GatherSub,
        &[values, labels.clone(), logits],
        &Attributes::new(),
        TOL,
        "gpu gather_sub",
    )
    .await;

    let probs = random(&[4, 3], 0.0, 1.0);
    let dy = random(&[4], -1.0, 1.0);
    parity(
        Op::ScatterSub,
        &[probs, labels, dy],
        &Attributes::new(),
        TOL,
        "gpu scatter_sub",
    )
    .await;
}

#[tokio::test]
async fn adam_parity() {
    let moments = random_packed(&[6, 2], -0.5, 0.5);
    let gradient = random(&[6], -3.0, 3.0);
    let attrs = Attributes::new().with_f32("beta1", 0.9).with_f32("beta2", 0.99);
    parity(
        Op::AdamMoments,
        &[moments.clone(), gradient],
        &attrs,
        PACKED_TOL,
        "gpu adam_moments",
    )
    .await;

    let value = random(&[6], -1.0, 1.0);
    let attrs = attrs
        .with_f32("epsilon", 1e-8)
        .with_f32("learning_rate", 0.01);
    parity(Op::AdamAdjust, &[moments, value], &attrs, TOL, "gpu adam_adjust").await;
}

#[tokio::test]
async fn elementwise_parity_dense_and_packed() {
    for op in [Op::Add, Op::Sub, Op::Mul] {
        let a = random(&[3, 8], -2.0, 2.0);
        let b = random(&[3, 8], -2.0, 2.0);
        parity(op, &[a, b], &Attributes::new(), TOL, op.name()).await;

        let ap = random_packed(&[3, 7], -2.0, 2.0);
        let bp = random_packed(&[3, 7], -2.0, 2.0);
        parity(op, &[ap, bp], &Attributes::new(), PACKED_TOL, op.name()).await;
    }
}

#[tokio::test]
async fn device_tensors_chain_without_readback() {
    let Some(engine) = accelerator_engine().await else {
        return;
    };
    // rms_norm output feeds softmax directly; only the final tensor comes
    // back to the host.
    let x = random(&[2, 16], -2.0, 2.0);
    let gamma = random(&[16], 0.5, 1.5);
    let normed = run(&engine, Op::RmsNorm, Accelerator, &[x.clone(), gamma.clone()], &Attributes::new());
    assert!(normed[0].is_gpu());
    let soft = run(&engine, Op::FusedSoftmax, Accelerator, &normed, &Attributes::new());

    let want_norm = run(&engine, Op::RmsNorm, Reference, &[x, gamma], &Attributes::new());
    let want = run(&engine, Op::FusedSoftmax, Reference, &want_norm, &Attributes::new());
    assert_close_after_readback(&engine, &soft[0], &want[0], TOL, "gpu chained").await;
}

#[tokio::test]
async fn shape_primitives_stay_host_side() {
    let Some(engine) = accelerator_engine().await else {
        return;
    };
    let x = random(&[2, 3, 4], -1.0, 1.0);
    let err = engine
        .invoke_on(Op::Sum, Accelerator, &[x], &Attributes::new())
        .unwrap_err();
    assert!(matches!(err, crate::error::KernelError::MissingKernel { .. }));
}
