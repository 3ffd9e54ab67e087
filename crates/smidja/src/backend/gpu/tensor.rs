//! Device-resident tensor storage.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ndarray::{ArrayD, IxDyn};
use wgpu::util::DeviceExt;

use crate::tensor::{packed_lanes, DType};

use super::context::WgpuContext;

/// A buffer handle plus logical shape/dtype. Cloning clones the handle,
/// not the storage. Contents become readable on the host only through
/// [`GpuTensor::read_raw`], which awaits queue completion.
#[derive(Debug, Clone)]
pub struct GpuTensor {
    buffer: Arc<wgpu::Buffer>,
    shape: Vec<usize>,
    dtype: DType,
    ctx: Arc<WgpuContext>,
}

impl GpuTensor {
    /// Allocates an uninitialized storage buffer for `shape`/`dtype`.
    pub fn new_allocation(ctx: &Arc<WgpuContext>, shape: Vec<usize>, dtype: DType) -> Self {
        let size = byte_size(&shape, dtype) as u64;
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("smidja-tensor"),
            size: size.max(4),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self {
            buffer: Arc::new(buffer),
            shape,
            dtype,
            ctx: Arc::clone(ctx),
        }
    }

    /// Uploads host bytes, one storage element per 4-byte word.
    pub fn from_bytes(
        ctx: &Arc<WgpuContext>,
        shape: Vec<usize>,
        dtype: DType,
        bytes: &[u8],
    ) -> Self {
        let buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("smidja-tensor"),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        Self {
            buffer: Arc::new(buffer),
            shape,
            dtype,
            ctx: Arc::clone(ctx),
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn context(&self) -> &Arc<WgpuContext> {
        &self.ctx
    }

    /// Number of 4-byte storage words (lanes for packed tensors).
    pub fn storage_words(&self) -> usize {
        storage_words(&self.shape, self.dtype)
    }

    /// Copies the buffer into a staging area and awaits the map. This is
    /// the backend's only synchronization point.
    pub async fn read_raw(&self) -> Result<Vec<u8>> {
        let size = (self.storage_words() * 4) as u64;
        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("smidja-staging"),
            size: size.max(4),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("smidja-readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size.max(4));
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.ctx
            .device
            .poll(wgpu::PollType::Wait)
            .context("device poll failed")?;
        receiver
            .receive()
            .await
            .ok_or_else(|| anyhow!("readback channel closed"))?
            .context("buffer map failed")?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Readback into an f32 host array; only valid for dense f32 tensors.
    pub async fn to_array_f32(&self) -> Result<ArrayD<f32>> {
        if self.dtype != DType::F32 {
            return Err(anyhow!("expected f32 device tensor, found {}", self.dtype.as_str()));
        }
        let bytes = self.read_raw().await?;
        let values: Vec<f32> = bytemuck::cast_slice(&bytes)[..self.shape.iter().product()].to_vec();
        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|e| anyhow!(e))
    }

    /// Readback of the raw u32 lanes of a packed device tensor.
    pub async fn to_lanes_u32(&self) -> Result<ArrayD<u32>> {
        if self.dtype != DType::PackedF16 {
            return Err(anyhow!(
                "expected packed device tensor, found {}",
                self.dtype.as_str()
            ));
        }
        let bytes = self.read_raw().await?;
        let mut lane_shape = self.shape.clone();
        let last = lane_shape.last_mut().ok_or_else(|| anyhow!("rank-0 device tensor"))?;
        *last = packed_lanes(*last);
        let n: usize = lane_shape.iter().product();
        let values: Vec<u32> = bytemuck::cast_slice(&bytes)[..n].to_vec();
        ArrayD::from_shape_vec(IxDyn(&lane_shape), values).map_err(|e| anyhow!(e))
    }

    /// Readback into an i32 host array.
    pub async fn to_array_i32(&self) -> Result<ArrayD<i32>> {
        if self.dtype != DType::I32 {
            return Err(anyhow!("expected i32 device tensor, found {}", self.dtype.as_str()));
        }
        let bytes = self.read_raw().await?;
        let values: Vec<i32> = bytemuck::cast_slice(&bytes)[..self.shape.iter().product()].to_vec();
        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|e| anyhow!(e))
    }
}

/// 4-byte storage words for a logical shape. Packed tensors store
/// `packed_lanes(last)` words along the trailing axis.
pub(crate) fn storage_words(shape: &[usize], dtype: DType) -> usize {
    match dtype {
        DType::F32 | DType::I32 => shape.iter().product(),
        DType::PackedF16 => {
            let (last, rest) = match shape.split_last() {
                Some((l, r)) => (*l, r),
                None => return 0,
            };
            rest.iter().product::<usize>() * packed_lanes(last)
        }
    }
}

fn byte_size(shape: &[usize], dtype: DType) -> usize {
    storage_words(shape, dtype) * 4
}
