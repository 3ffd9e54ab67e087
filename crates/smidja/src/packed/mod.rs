//! Packed half-precision codec.
//!
//! Two scaled f16 values travel as one u32 storage lane along the trailing
//! axis. Packing halves the stored trailing dimension (rounding up for odd
//! lengths, with the spare half of the final lane zero-filled); unpacking
//! is the exact inverse up to half-precision rounding. The `scale` factor
//! exists for dynamic-range control: values are multiplied by it on the way
//! in and divided by it on the way out.

use half::f16;
use ndarray::{ArrayD, IxDyn};

use crate::error::{KernelError, KernelResult};
use crate::tensor::{packed_lanes, Tensor};

/// Encodes a pair of f32 values into one storage lane.
#[inline]
pub fn pack_lane(lo: f32, hi: f32) -> u32 {
    let lo = f16::from_f32(lo).to_bits() as u32;
    let hi = f16::from_f32(hi).to_bits() as u32;
    lo | (hi << 16)
}

/// Decodes one storage lane back into its two f32 halves.
#[inline]
pub fn unpack_lane(lane: u32) -> (f32, f32) {
    let lo = f16::from_bits((lane & 0xffff) as u16).to_f32();
    let hi = f16::from_bits((lane >> 16) as u16).to_f32();
    (lo, hi)
}

/// Packs an f32 array into half lanes, scaling each value by `scale`.
pub fn pack(x: &ArrayD<f32>, scale: f32) -> KernelResult<Tensor> {
    if x.ndim() == 0 {
        return Err(KernelError::contract(
            "pack",
            "cannot pack a rank-0 tensor",
        ));
    }
    let shape = x.shape().to_vec();
    let last = shape[shape.len() - 1];
    let lanes_last = packed_lanes(last);

    let mut lane_shape = shape.clone();
    *lane_shape.last_mut().unwrap() = lanes_last;

    let rows: usize = shape[..shape.len() - 1].iter().product();
    let src = x.as_standard_layout();
    let src = src.as_slice().expect("standard layout has a slice");

    let mut lanes = Vec::with_capacity(rows * lanes_last);
    for r in 0..rows {
        let row = &src[r * last..(r + 1) * last];
        for pair in 0..lanes_last {
            let lo = row[pair * 2] * scale;
            // Odd tail: the high half of the final lane is an exact zero.
            let hi = if pair * 2 + 1 < last {
                row[pair * 2 + 1] * scale
            } else {
                0.0
            };
            lanes.push(pack_lane(lo, hi));
        }
    }

    let lanes = ArrayD::from_shape_vec(IxDyn(&lane_shape), lanes)
        .map_err(|e| KernelError::packing("pack", e.to_string()))?;
    Tensor::from_packed(lanes, last)
}

/// Unpacks half lanes back to f32, dividing each value by `scale`.
pub fn unpack(t: &Tensor, scale: f32) -> KernelResult<ArrayD<f32>> {
    let (lanes, logical_last) = t.as_packed()?;
    let lane_shape = lanes.shape().to_vec();
    let lanes_last = lane_shape[lane_shape.len() - 1];
    let rows: usize = lane_shape[..lane_shape.len() - 1].iter().product();

    let mut out_shape = lane_shape.clone();
    *out_shape.last_mut().unwrap() = logical_last;

    let src = lanes.as_standard_layout();
    let src = src.as_slice().expect("standard layout has a slice");
    let inv = 1.0 / scale;

    let mut out = Vec::with_capacity(rows * logical_last);
    for r in 0..rows {
        let row = &src[r * lanes_last..(r + 1) * lanes_last];
        for (pair, lane) in row.iter().enumerate() {
            let (lo, hi) = unpack_lane(*lane);
            out.push(lo * inv);
            if pair * 2 + 1 < logical_last {
                out.push(hi * inv);
            }
        }
    }

    ArrayD::from_shape_vec(IxDyn(&out_shape), out)
        .map_err(|e| KernelError::packing("unpack", e.to_string()))
}

/// Unpacks when packed, passes f32 through untouched. Shared entry point
/// for host kernels that accept either packing state.
pub fn to_dense(t: &Tensor) -> KernelResult<ArrayD<f32>> {
    if t.is_packed() {
        unpack(t, 1.0)
    } else {
        Ok(t.as_f32()?.clone())
    }
}

/// Repacks `out` when `like` was packed, mirroring the input packing state
/// onto an operator's output.
pub fn like_input(out: ArrayD<f32>, like: &Tensor) -> KernelResult<Tensor> {
    if like.is_packed() {
        pack(&out, 1.0)
    } else {
        Ok(Tensor::from_f32(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    #[test]
    fn round_trip_even_tail() {
        let x = Array2::random((4, 64), Uniform::new(-100.0f32, 100.0)).into_dyn();
        let packed = pack(&x, 1.0).unwrap();
        assert_eq!(packed.shape(), x.shape().to_vec());

        let back = unpack(&packed, 1.0).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            let rel = (a - b).abs() / a.abs().max(1.0);
            assert!(rel <= 1e-3, "round-trip drift: {a} vs {b}");
        }
    }

    #[test]
    fn round_trip_with_scale() {
        let x = Array2::random((3, 8), Uniform::new(-2.0f32, 2.0)).into_dyn();
        let packed = pack(&x, 16.0).unwrap();
        let back = unpack(&packed, 16.0).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1e-3, "scaled round-trip drift: {a} vs {b}");
        }
    }

    #[test]
    fn odd_tail_pads_with_zero() {
        let x = Array2::from_shape_vec((1, 3), vec![1.0f32, 2.0, 3.0])
            .unwrap()
            .into_dyn();
        let packed = pack(&x, 1.0).unwrap();
        let (lanes, logical_last) = packed.as_packed().unwrap();
        assert_eq!(logical_last, 3);
        assert_eq!(lanes.shape(), &[1, 2]);

        // The padding half must be bit-exact zero, not merely small.
        let tail = lanes[[0, 1]];
        assert_eq!(tail >> 16, 0, "odd-tail padding is not an exact zero");

        let back = unpack(&packed, 1.0).unwrap();
        assert_eq!(back.shape(), &[1, 3]);
        assert_eq!(back[[0, 2]], 3.0);
    }

    #[test]
    fn lane_codec_is_exact_for_f16_values() {
        let lane = pack_lane(0.5, -2.25);
        let (lo, hi) = unpack_lane(lane);
        assert_eq!(lo, 0.5);
        assert_eq!(hi, -2.25);
    }

    #[test]
    fn rank_zero_is_rejected() {
        let x = ArrayD::from_elem(IxDyn(&[]), 1.0f32);
        assert!(pack(&x, 1.0).is_err());
    }
}
