//! Per-invocation operator attributes.
//!
//! Attributes are an immutable scalar map passed alongside the input
//! tensors; they are not part of the tensor graph and are never
//! differentiated. Typed accessors fail with a contract violation naming
//! the operator and the missing/mistyped key.

use std::collections::HashMap;

use crate::error::{KernelError, KernelResult};

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    F32(f32),
    I64(i64),
    /// Integer lists for the shape-manipulating primitives
    /// (reshape dims, slice offsets/sizes).
    Ints(Vec<i64>),
}

#[derive(Debug, Clone, Default)]
pub struct Attributes {
    values: HashMap<&'static str, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_f32(mut self, key: &'static str, v: f32) -> Self {
        self.values.insert(key, AttrValue::F32(v));
        self
    }

    pub fn with_i64(mut self, key: &'static str, v: i64) -> Self {
        self.values.insert(key, AttrValue::I64(v));
        self
    }

    pub fn with_ints(mut self, key: &'static str, v: Vec<i64>) -> Self {
        self.values.insert(key, AttrValue::Ints(v));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn f32(&self, op: &'static str, key: &'static str) -> KernelResult<f32> {
        match self.values.get(key) {
            Some(AttrValue::F32(v)) => Ok(*v),
            // Accept integer literals where a float is expected; embedders
            // routinely pass `2` for a divisor of `2.0`.
            Some(AttrValue::I64(v)) => Ok(*v as f32),
            Some(other) => Err(mistyped(op, key, "f32", other)),
            None => Err(missing(op, key)),
        }
    }

    pub fn f32_or(&self, op: &'static str, key: &'static str, default: f32) -> KernelResult<f32> {
        if self.contains(key) {
            self.f32(op, key)
        } else {
            Ok(default)
        }
    }

    pub fn i64(&self, op: &'static str, key: &'static str) -> KernelResult<i64> {
        match self.values.get(key) {
            Some(AttrValue::I64(v)) => Ok(*v),
            Some(other) => Err(mistyped(op, key, "i64", other)),
            None => Err(missing(op, key)),
        }
    }

    pub fn i64_or(&self, op: &'static str, key: &'static str, default: i64) -> KernelResult<i64> {
        if self.contains(key) {
            self.i64(op, key)
        } else {
            Ok(default)
        }
    }

    pub fn usize(&self, op: &'static str, key: &'static str) -> KernelResult<usize> {
        let v = self.i64(op, key)?;
        usize::try_from(v).map_err(|_| {
            KernelError::contract(op, format!("attribute `{key}` must be non-negative, got {v}"))
        })
    }

    pub fn usize_or(
        &self,
        op: &'static str,
        key: &'static str,
        default: usize,
    ) -> KernelResult<usize> {
        if self.contains(key) {
            self.usize(op, key)
        } else {
            Ok(default)
        }
    }

    pub fn ints(&self, op: &'static str, key: &'static str) -> KernelResult<&[i64]> {
        match self.values.get(key) {
            Some(AttrValue::Ints(v)) => Ok(v),
            Some(other) => Err(mistyped(op, key, "ints", other)),
            None => Err(missing(op, key)),
        }
    }
}

fn missing(op: &'static str, key: &'static str) -> KernelError {
    KernelError::contract(op, format!("missing required attribute `{key}`"))
}

fn mistyped(op: &'static str, key: &'static str, want: &str, got: &AttrValue) -> KernelError {
    KernelError::contract(
        op,
        format!("attribute `{key}` must be {want}, got {got:?}"),
    )
}
