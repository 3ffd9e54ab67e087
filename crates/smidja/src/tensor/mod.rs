//! Tensor type shared by every backend.
//!
//! A tensor is an N-dimensional array of one fixed element type with its
//! storage owned by exactly one backend at a time: host storage is `ndarray`
//! based, accelerator storage is a `wgpu` buffer handle. All fused kernels
//! are limited to rank <= 4; that constraint is enforced at dispatch time,
//! not here.

pub mod dtype;

use ndarray::{ArrayD, IxDyn};

use crate::backend::gpu::GpuTensor;
use crate::error::{KernelError, KernelResult};
pub use dtype::{packed_lanes, DType};

/// Backing storage for a [`Tensor`].
#[derive(Debug, Clone)]
pub enum TensorData {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
    /// Packed half-precision lanes. The array's trailing axis holds
    /// `packed_lanes(logical_last)` lanes of two f16 values each.
    PackedF16 {
        lanes: ArrayD<u32>,
        logical_last: usize,
    },
    /// Device-resident storage; readable on the host only after the
    /// explicit asynchronous readback point.
    Gpu(GpuTensor),
}

#[derive(Debug, Clone)]
pub struct Tensor {
    data: TensorData,
}

impl Tensor {
    pub fn from_f32(arr: ArrayD<f32>) -> Self {
        Self {
            data: TensorData::F32(arr),
        }
    }

    pub fn from_i32(arr: ArrayD<i32>) -> Self {
        Self {
            data: TensorData::I32(arr),
        }
    }

    /// Wraps packed lanes produced by the codec. `logical_last` is the
    /// pre-packing trailing dimension; the lane array's trailing axis must
    /// equal `packed_lanes(logical_last)`.
    pub fn from_packed(lanes: ArrayD<u32>, logical_last: usize) -> KernelResult<Self> {
        let stored_last = lanes.shape().last().copied().unwrap_or(0);
        if stored_last != packed_lanes(logical_last) {
            return Err(KernelError::packing(
                "tensor",
                format!(
                    "lane axis is {stored_last} but logical trailing dim {logical_last} needs {}",
                    packed_lanes(logical_last)
                ),
            ));
        }
        Ok(Self {
            data: TensorData::PackedF16 {
                lanes,
                logical_last,
            },
        })
    }

    pub fn from_gpu(gpu: GpuTensor) -> Self {
        Self {
            data: TensorData::Gpu(gpu),
        }
    }

    pub fn zeros_f32(shape: &[usize]) -> Self {
        Self::from_f32(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn dtype(&self) -> DType {
        match &self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::PackedF16 { .. } => DType::PackedF16,
            TensorData::Gpu(g) => g.dtype(),
        }
    }

    pub fn is_packed(&self) -> bool {
        self.dtype().is_packed()
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.data, TensorData::Gpu(_))
    }

    /// Logical shape. For packed tensors the trailing dimension is the
    /// pre-packing length, not the lane count.
    pub fn shape(&self) -> Vec<usize> {
        match &self.data {
            TensorData::F32(a) => a.shape().to_vec(),
            TensorData::I32(a) => a.shape().to_vec(),
            TensorData::PackedF16 {
                lanes,
                logical_last,
            } => {
                let mut s = lanes.shape().to_vec();
                if let Some(last) = s.last_mut() {
                    *last = *logical_last;
                }
                s
            }
            TensorData::Gpu(g) => g.shape().to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn as_f32(&self) -> KernelResult<&ArrayD<f32>> {
        match &self.data {
            TensorData::F32(a) => Ok(a),
            other => Err(KernelError::contract(
                "tensor",
                format!("expected f32 host storage, found {}", storage_name(other)),
            )),
        }
    }

    pub fn as_i32(&self) -> KernelResult<&ArrayD<i32>> {
        match &self.data {
            TensorData::I32(a) => Ok(a),
            other => Err(KernelError::contract(
                "tensor",
                format!("expected i32 host storage, found {}", storage_name(other)),
            )),
        }
    }

    pub fn as_packed(&self) -> KernelResult<(&ArrayD<u32>, usize)> {
        match &self.data {
            TensorData::PackedF16 {
                lanes,
                logical_last,
            } => Ok((lanes, *logical_last)),
            other => Err(KernelError::packing(
                "tensor",
                format!("expected packed storage, found {}", storage_name(other)),
            )),
        }
    }

    pub fn as_gpu(&self) -> KernelResult<&GpuTensor> {
        match &self.data {
            TensorData::Gpu(g) => Ok(g),
            other => Err(KernelError::contract(
                "tensor",
                format!("expected device storage, found {}", storage_name(other)),
            )),
        }
    }

    pub fn dims3(&self) -> KernelResult<(usize, usize, usize)> {
        let s = self.shape();
        if s.len() != 3 {
            return Err(KernelError::contract(
                "tensor",
                format!("expected rank 3, found shape {s:?}"),
            ));
        }
        Ok((s[0], s[1], s[2]))
    }

    pub fn dims4(&self) -> KernelResult<(usize, usize, usize, usize)> {
        let s = self.shape();
        if s.len() != 4 {
            return Err(KernelError::contract(
                "tensor",
                format!("expected rank 4, found shape {s:?}"),
            ));
        }
        Ok((s[0], s[1], s[2], s[3]))
    }
}

fn storage_name(data: &TensorData) -> &'static str {
    match data {
        TensorData::F32(_) => "f32",
        TensorData::I32(_) => "i32",
        TensorData::PackedF16 { .. } => "packed_f16",
        TensorData::Gpu(_) => "gpu",
    }
}

impl<D: ndarray::Dimension> From<ndarray::Array<f32, D>> for Tensor {
    fn from(arr: ndarray::Array<f32, D>) -> Self {
        Tensor::from_f32(arr.into_dyn())
    }
}

impl<D: ndarray::Dimension> From<ndarray::Array<i32, D>> for Tensor {
    fn from(arr: ndarray::Array<i32, D>) -> Self {
        Tensor::from_i32(arr.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    #[test]
    fn logical_shape_of_packed_tensor() {
        let lanes = ArrayD::zeros(IxDyn(&[2, 3]));
        let t = Tensor::from_packed(lanes, 6).unwrap();
        assert_eq!(t.shape(), vec![2, 6]);
        assert_eq!(t.num_elements(), 12);
        assert!(t.is_packed());
    }

    #[test]
    fn packed_odd_tail_rounds_up() {
        let lanes = ArrayD::zeros(IxDyn(&[4, 3]));
        let t = Tensor::from_packed(lanes, 5).unwrap();
        assert_eq!(t.shape(), vec![4, 5]);
    }

    #[test]
    fn packed_lane_mismatch_is_rejected() {
        let lanes = ArrayD::<u32>::zeros(IxDyn(&[2, 4]));
        assert!(Tensor::from_packed(lanes, 6).is_err());
    }

    #[test]
    fn dims_helpers() {
        let t: Tensor = Array3::<f32>::zeros((2, 3, 4)).into();
        assert_eq!(t.dims3().unwrap(), (2, 3, 4));
        assert!(t.dims4().is_err());

        let t2: Tensor = Array2::<f32>::zeros((5, 6)).into();
        assert_eq!(t2.rank(), 2);
        assert!(t2.as_i32().is_err());
    }
}
