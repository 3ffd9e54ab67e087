//! The three backend executors behind the shared operator contract.

pub mod gpu;
pub mod reference;
pub mod vectorized;
