//! Backend-agnostic kernel math shared by the scalar, vectorized and
//! accelerator implementations.

pub mod dropout;

use ndarray::{Array1, Array2, Array3, Array4, ArrayD};

use crate::error::{KernelError, KernelResult};

macro_rules! dim_helper {
    ($name:ident, $out:ty) => {
        pub(crate) fn $name(op: &'static str, a: ArrayD<f32>) -> KernelResult<$out> {
            a.into_dimensionality()
                .map_err(|e| KernelError::contract(op, e.to_string()))
        }
    };
}

dim_helper!(dim1, Array1<f32>);
dim_helper!(dim2, Array2<f32>);
dim_helper!(dim3, Array3<f32>);
dim_helper!(dim4, Array4<f32>);

