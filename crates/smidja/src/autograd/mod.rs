//! Gradient bindings for the reverse-mode tape.
//!
//! A binding maps an operator name to a backward function. The tape calls
//! the backward function with the saved inputs/outputs and the per-output
//! adjoints; it gets back one lazy thunk per differentiable input. Thunks
//! the tape never pulls are never computed. Every thunk must produce a
//! tensor matching its input's shape, in either the input's dtype or its
//! packed equivalent.

pub mod bindings;

use std::collections::HashMap;

use crate::engine::Engine;
use crate::error::{KernelError, KernelResult};
use crate::ops::Attributes;
use crate::tensor::Tensor;

/// Everything the tape hands a backward function.
pub struct BackwardArgs<'a> {
    pub inputs: &'a [Tensor],
    pub outputs: &'a [Tensor],
    pub output_grads: &'a [Tensor],
    pub attrs: &'a Attributes,
}

/// Deferred adjoint computation for one input, keyed by the operator's
/// input name.
pub type GradThunk = Box<dyn FnOnce(&Engine) -> KernelResult<Tensor> + Send>;

pub type BackwardFn =
    Box<dyn Fn(&BackwardArgs<'_>) -> KernelResult<Vec<(&'static str, GradThunk)>> + Send + Sync>;

#[derive(Default)]
pub struct GradientRegistry {
    table: HashMap<String, BackwardFn>,
}

impl GradientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the built-in bindings for the fused operators.
    pub fn with_defaults() -> KernelResult<Self> {
        let mut registry = Self::new();
        bindings::register_defaults(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, f: BackwardFn) -> KernelResult<()> {
        let name = name.into();
        if self.table.contains_key(&name) {
            return Err(KernelError::DuplicateGradient { name });
        }
        self.table.insert(name, f);
        Ok(())
    }

    pub fn get(&self, name: &str) -> KernelResult<&BackwardFn> {
        self.table.get(name).ok_or_else(|| KernelError::MissingGradient {
            name: name.to_string(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut registry = GradientRegistry::new();
        registry
            .register("rms_norm", Box::new(|_| Ok(vec![])))
            .unwrap();
        let err = registry
            .register("rms_norm", Box::new(|_| Ok(vec![])))
            .unwrap_err();
        assert!(matches!(err, KernelError::DuplicateGradient { .. }));
    }

    #[test]
    fn missing_binding_is_an_error() {
        let registry = GradientRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(KernelError::MissingGradient { .. })
        ));
    }

    #[test]
    fn defaults_cover_the_fused_forward_ops() {
        let registry = GradientRegistry::with_defaults().unwrap();
        for name in [
            "qkv",
            "rope",
            "attention_scores",
            "fused_softmax",
            "rms_norm",
            "gather_sub",
        ] {
            assert!(registry.has(name), "missing default binding for {name}");
        }
    }
}
