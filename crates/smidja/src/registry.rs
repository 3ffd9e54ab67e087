//! Kernel registry and dispatch.
//!
//! One capability-indexed table, `(operator, backend) -> kernel`, built at
//! engine construction and never mutated afterwards. Dispatch validates the
//! operator contract, determines the operands' packing state and routes to
//! the registered implementation; a missing entry is a hard `MissingKernel`
//! error, never a silent fallback onto another backend.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::gpu::WgpuContext;
use crate::error::{KernelError, KernelResult};
use crate::ops::{validate::validate, Attributes, Op};
use crate::tensor::Tensor;

/// The three execution models behind the single operator contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Scalar, synchronous, full precision. The correctness baseline.
    Reference,
    /// Batched ndarray/rayon math, synchronous from the caller's view.
    Vectorized,
    /// wgpu compute-shader dispatch; results materialize at the explicit
    /// readback point.
    Accelerator,
}

/// Per-invocation context handed to every kernel.
pub struct KernelCtx<'a> {
    /// Device context; populated only when the accelerator backend is live.
    pub gpu: Option<&'a Arc<WgpuContext>>,
    /// Whether any operand is packed. Computed once by dispatch so
    /// elementwise kernels can short-circuit to the plain f32 primitive
    /// when nothing is packed, keeping full-precision arithmetic.
    pub any_packed: bool,
}

pub type KernelFn =
    Box<dyn Fn(&KernelCtx<'_>, &[Tensor], &Attributes) -> KernelResult<Vec<Tensor>> + Send + Sync>;

#[derive(Default)]
pub struct KernelRegistry {
    table: HashMap<(Op, BackendKind), KernelFn>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an implementation. Registering the same `(op, backend)` pair
    /// twice is an error; the table is write-once.
    pub fn register(&mut self, op: Op, backend: BackendKind, kernel: KernelFn) -> KernelResult<()> {
        if self.table.contains_key(&(op, backend)) {
            return Err(KernelError::DuplicateKernel {
                op: op.name(),
                backend,
            });
        }
        self.table.insert((op, backend), kernel);
        Ok(())
    }

    pub fn has(&self, op: Op, backend: BackendKind) -> bool {
        self.table.contains_key(&(op, backend))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Validates the contract and routes to the backend's implementation.
    pub fn invoke(
        &self,
        op: Op,
        backend: BackendKind,
        gpu: Option<&Arc<WgpuContext>>,
        inputs: &[Tensor],
        attrs: &Attributes,
    ) -> KernelResult<Vec<Tensor>> {
        validate(op, inputs, attrs)?;

        let kernel = self
            .table
            .get(&(op, backend))
            .ok_or(KernelError::MissingKernel {
                op: op.name(),
                backend,
            })?;

        let any_packed = inputs.iter().any(Tensor::is_packed);
        log::trace!(
            "dispatch {} on {:?} ({} inputs, packed={})",
            op.name(),
            backend,
            inputs.len(),
            any_packed
        );

        let ctx = KernelCtx { gpu, any_packed };
        let outputs = kernel(&ctx, inputs, attrs)?;

        if outputs.len() != op.output_count() {
            return Err(KernelError::contract(
                op.name(),
                format!(
                    "kernel produced {} outputs, contract says {}",
                    outputs.len(),
                    op.output_count()
                ),
            ));
        }
        Ok(outputs)
    }
}
