//! Cross-backend and cross-operator properties. Per-kernel unit tests
//! live next to the kernels; this module checks the contracts that span
//! modules: gradient correctness, backend parity and the optimizer math.

pub mod common;

mod gpu;
mod parity;
