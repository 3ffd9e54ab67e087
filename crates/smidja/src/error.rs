//! Kernel-layer error taxonomy.
//!
//! Every error here is unrecoverable for the current forward/backward pass;
//! the engine never retries internally. Numerical tail cases (epsilon-guarded
//! rsqrt, saturated tanh) are tolerated in the math and never surface here.

use thiserror::Error;

use crate::registry::BackendKind;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    /// A shape/rank/dtype/attribute precondition of an operator was violated.
    #[error("contract violation in `{op}`: {reason}")]
    ContractViolation { op: &'static str, reason: String },

    /// The active backend has no implementation registered for the operator.
    #[error("no `{op}` kernel registered for the {backend:?} backend")]
    MissingKernel {
        op: &'static str,
        backend: BackendKind,
    },

    /// A packed operand reached an implementation that only handles dense
    /// tensors (or the other way around).
    #[error("packing mismatch in `{op}`: {reason}")]
    PackingMismatch { op: &'static str, reason: String },

    /// Registration-time collision; the kernel table is built once at
    /// startup and never mutated afterwards.
    #[error("kernel for `{op}` already registered on the {backend:?} backend")]
    DuplicateKernel {
        op: &'static str,
        backend: BackendKind,
    },

    #[error("gradient for `{name}` already registered")]
    DuplicateGradient { name: String },

    #[error("no gradient registered for `{name}`")]
    MissingGradient { name: String },

    /// Device/queue failures from the accelerator backend.
    #[error("accelerator error in `{op}`: {source}")]
    Accelerator {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl KernelError {
    pub fn contract(op: &'static str, reason: impl Into<String>) -> Self {
        KernelError::ContractViolation {
            op,
            reason: reason.into(),
        }
    }

    pub fn packing(op: &'static str, reason: impl Into<String>) -> Self {
        KernelError::PackingMismatch {
            op,
            reason: reason.into(),
        }
    }
}
