// Shared helpers for the cross-backend test suite.
#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::ops::{Attributes, Op};
use crate::packed;
use crate::registry::BackendKind;
use crate::tensor::Tensor;

pub fn host_engine() -> Engine {
    Engine::new(EngineConfig::default()).expect("host engine")
}

/// Builds an accelerator engine, or skips the calling test when the host
/// has no usable adapter.
pub async fn accelerator_engine() -> Option<Engine> {
    let cfg = EngineConfig {
        backend: BackendKind::Accelerator,
        ..Default::default()
    };
    match Engine::with_accelerator(cfg).await {
        Ok(engine) => Some(engine),
        Err(err) => {
            eprintln!("no accelerator available, skipping: {err}");
            None
        }
    }
}

pub fn random(shape: &[usize], lo: f32, hi: f32) -> Tensor {
    Tensor::from_f32(ArrayD::random(IxDyn(shape), Uniform::new(lo, hi)))
}

pub fn random_packed(shape: &[usize], lo: f32, hi: f32) -> Tensor {
    let dense = ArrayD::random(IxDyn(shape), Uniform::new(lo, hi));
    packed::pack(&dense, 1.0).expect("packable shape")
}

pub fn run(
    engine: &Engine,
    op: Op,
    backend: BackendKind,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> Vec<Tensor> {
    engine
        .invoke_on(op, backend, inputs, attrs)
        .unwrap_or_else(|e| panic!("{} on {:?} failed: {e}", op.name(), backend))
}

/// Elementwise comparison that widens packed operands first. Prints both
/// tensors on failure; the suite works with small shapes on purpose.
pub fn assert_close(got: &Tensor, want: &Tensor, tolerance: f32, label: &str) {
    let got = packed::to_dense(got).expect("host tensor");
    let want = packed::to_dense(want).expect("host tensor");
    assert_eq!(got.shape(), want.shape(), "{label}: shape mismatch");
    let close = got
        .iter()
        .zip(want.iter())
        .all(|(a, b)| (a == b) || (a - b).abs() < tolerance);
    if !close {
        println!("got: \n{got:?}");
        println!("want: \n{want:?}");
        panic!("tensor '{label}' diverges beyond {tolerance}");
    }
}

/// Reads a device result back and compares it against a host tensor.
pub async fn assert_close_after_readback(
    engine: &Engine,
    got: &Tensor,
    want: &Tensor,
    tolerance: f32,
    label: &str,
) {
    let host = engine.read_back(got).await.expect("readback");
    assert_close(&host, want, tolerance, label);
}
