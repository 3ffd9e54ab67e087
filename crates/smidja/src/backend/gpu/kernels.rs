//! Accelerator kernel implementations.
//!
//! Each kernel uploads host operands (device-resident operands are passed
//! through), fetches the specialized pipeline from the context cache,
//! binds buffers in declaration order against the shader's derived layout
//! and enqueues one dispatch. The returned tensor is a device handle;
//! nothing blocks here. Readback is the engine's explicit sync point.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::error::{KernelError, KernelResult};
use crate::ops::validate::resolve_axis;
use crate::ops::Attributes;
use crate::packed;
use crate::registry::KernelCtx;
use crate::tensor::{DType, Tensor};

use super::context::WgpuContext;
use super::shaders;
use super::tensor::GpuTensor;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PastLenParams {
    past_len: u32,
    pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ScoreParams {
    scale: f32,
    past_len: u32,
    pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SoftmaxParams {
    rate: f32,
    seed: u32,
    pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MomentParams {
    beta1: f32,
    beta2: f32,
    pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct AdjustParams {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    lr: f32,
}

fn device<'a>(ctx: &'a KernelCtx<'_>, op: &'static str) -> KernelResult<&'a Arc<WgpuContext>> {
    ctx.gpu.ok_or_else(|| {
        KernelError::contract(op, "accelerator backend invoked without a device context")
    })
}

/// Moves a tensor onto the device, or passes a resident handle through.
fn ensure_device(g: &Arc<WgpuContext>, op: &'static str, t: &Tensor) -> KernelResult<GpuTensor> {
    use crate::tensor::TensorData;
    match t.data() {
        TensorData::Gpu(dev) => Ok(dev.clone()),
        TensorData::F32(a) => {
            let std = a.as_standard_layout();
            let slice = std.as_slice().expect("standard layout has a slice");
            Ok(GpuTensor::from_bytes(
                g,
                t.shape(),
                DType::F32,
                bytemuck::cast_slice(slice),
            ))
        }
        TensorData::I32(a) => {
            let std = a.as_standard_layout();
            let slice = std.as_slice().expect("standard layout has a slice");
            Ok(GpuTensor::from_bytes(
                g,
                t.shape(),
                DType::I32,
                bytemuck::cast_slice(slice),
            ))
        }
        TensorData::PackedF16 { lanes, .. } => {
            let std = lanes.as_standard_layout();
            let slice = std.as_slice().expect("standard layout has a slice");
            Ok(GpuTensor::from_bytes(
                g,
                t.shape(),
                DType::PackedF16,
                bytemuck::cast_slice(slice),
            ))
        }
        #[allow(unreachable_patterns)]
        _ => Err(KernelError::contract(op, "unsupported storage for upload")),
    }
}

fn require_dense(op: &'static str, t: &Tensor) -> KernelResult<()> {
    if t.is_packed() {
        return Err(KernelError::packing(
            op,
            "this accelerator kernel has no packed variant",
        ));
    }
    Ok(())
}

fn uniform(g: &Arc<WgpuContext>, label: &'static str, bytes: &[u8]) -> wgpu::Buffer {
    g.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytes,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        })
}

/// Binds `buffers` in order against the pipeline's derived layout and
/// enqueues one dispatch covering `threads` invocations.
fn dispatch(
    g: &Arc<WgpuContext>,
    label: &'static str,
    pipeline: &wgpu::ComputePipeline,
    buffers: &[&wgpu::Buffer],
    threads: usize,
    workgroup: u32,
) {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, b)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: b.as_entire_binding(),
        })
        .collect();
    let bind_group = g.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout: &pipeline.get_bind_group_layout(0),
        entries: &entries,
    });

    let mut encoder = g
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups((threads as u32).div_ceil(workgroup), 1, 1);
    }
    g.queue.submit(Some(encoder.finish()));
}

pub(crate) fn qkv(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "qkv")?;
    require_dense("qkv", &inputs[0])?;
    require_dense("qkv", &inputs[1])?;
    let heads = attrs.usize("qkv", "heads")?;
    let (b, t, c) = inputs[0].dims3()?;
    let dh = c / heads;

    let x = ensure_device(g, "qkv", &inputs[0])?;
    let kernel = ensure_device(g, "qkv", &inputs[1])?;
    let outs: Vec<GpuTensor> = (0..3)
        .map(|_| GpuTensor::new_allocation(g, vec![b, heads, t, dh], DType::F32))
        .collect();

    let sig = format!("b{b}.t{t}.c{c}.h{heads}");
    let pipeline = g.pipeline("qkv", sig, || shaders::qkv(b, t, c, heads));
    dispatch(
        g,
        "qkv",
        &pipeline,
        &[
            x.buffer(),
            kernel.buffer(),
            outs[0].buffer(),
            outs[1].buffer(),
            outs[2].buffer(),
        ],
        b * t * 3 * c,
        256,
    );
    Ok(outs.into_iter().map(Tensor::from_gpu).collect())
}

pub(crate) fn rope(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "rope")?;
    let past_len = attrs.usize_or("rope", "past_len", 0)?;
    let (b, h, t, d) = inputs[0].dims4()?;
    let tcols = inputs[1].shape()[1];
    let half = tcols.min(d / 2);
    let is_packed = inputs[0].is_packed();

    let x = ensure_device(g, "rope", &inputs[0])?;
    let sin = ensure_device(g, "rope", &inputs[1])?;
    let cos = ensure_device(g, "rope", &inputs[2])?;
    let out = GpuTensor::new_allocation(g, vec![b, h, t, d], x.dtype());

    let params = uniform(
        g,
        "rope-params",
        bytemuck::bytes_of(&PastLenParams {
            past_len: past_len as u32,
            pad: [0; 3],
        }),
    );
    let sig = format!("b{b}.h{h}.t{t}.d{d}.half{half}.tc{tcols}.p{}", is_packed as u8);
    let pipeline = g.pipeline("rope", sig, || {
        shaders::rope(b, h, t, d, half, tcols, is_packed)
    });
    dispatch(
        g,
        "rope",
        &pipeline,
        &[x.buffer(), sin.buffer(), cos.buffer(), out.buffer(), &params],
        b * h * t,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn attention_scores(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "attention_scores")?;
    require_dense("attention_scores", &inputs[0])?;
    require_dense("attention_scores", &inputs[1])?;
    let scale = attrs.f32("attention_scores", "scale")?;
    let past_len = attrs.usize_or("attention_scores", "past_len", 0)?;
    let (b, h, t1, d) = inputs[0].dims4()?;
    let t2 = inputs[1].dims4()?.2;
    if d % 4 != 0 {
        return Err(KernelError::contract(
            "attention_scores",
            format!("accelerator path needs head dim divisible by 4, got {d}"),
        ));
    }

    let q = ensure_device(g, "attention_scores", &inputs[0])?;
    let k = ensure_device(g, "attention_scores", &inputs[1])?;
    let out = GpuTensor::new_allocation(g, vec![b, h, t1, t2], DType::F32);

    let params = uniform(
        g,
        "attention-params",
        bytemuck::bytes_of(&ScoreParams {
            scale,
            past_len: past_len as u32,
            pad: [0; 2],
        }),
    );
    let sig = format!("b{b}.h{h}.t1_{t1}.t2_{t2}.d{d}");
    let pipeline = g.pipeline("attention_scores", sig, || {
        shaders::attention_scores(b, h, t1, t2, d)
    });
    dispatch(
        g,
        "attention_scores",
        &pipeline,
        &[q.buffer(), k.buffer(), out.buffer(), &params],
        b * h * t1,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn fused_softmax(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "fused_softmax")?;
    let shape = inputs[0].shape();
    let axis = resolve_axis(
        attrs.i64_or("fused_softmax", "axis", -1)?,
        shape.len(),
    );
    if axis != shape.len() - 1 {
        return Err(KernelError::contract(
            "fused_softmax",
            "accelerator softmax supports the trailing axis only",
        ));
    }
    let rate = attrs.f32_or("fused_softmax", "dropout_rate", 0.0)?;
    let seed = attrs.i64_or("fused_softmax", "seed", 0)? as u32;
    let c = *shape.last().unwrap_or(&1);
    let rows: usize = shape[..shape.len() - 1].iter().product();
    let is_packed = inputs[0].is_packed();

    let x = ensure_device(g, "fused_softmax", &inputs[0])?;
    let out = GpuTensor::new_allocation(g, shape.clone(), x.dtype());
    let params = uniform(
        g,
        "softmax-params",
        bytemuck::bytes_of(&SoftmaxParams {
            rate,
            seed,
            pad: [0; 2],
        }),
    );
    let sig = format!("r{rows}.c{c}.p{}", is_packed as u8);
    let pipeline = g.pipeline("fused_softmax", sig, || {
        shaders::fused_softmax(rows, c, is_packed)
    });
    dispatch(
        g,
        "fused_softmax",
        &pipeline,
        &[x.buffer(), out.buffer(), &params],
        rows,
        64,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn rms_norm(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "rms_norm")?;
    let shape = inputs[0].shape();
    let c = *shape.last().unwrap_or(&1);
    let rows: usize = shape[..shape.len() - 1].iter().product();
    let is_packed = inputs[0].is_packed();

    let x = ensure_device(g, "rms_norm", &inputs[0])?;
    // gamma is always consumed dense on the device
    let gamma_dense = if inputs[1].is_gpu() {
        require_dense("rms_norm", &inputs[1])?;
        ensure_device(g, "rms_norm", &inputs[1])?
    } else {
        let widened = Tensor::from_f32(packed::to_dense(&inputs[1])?);
        ensure_device(g, "rms_norm", &widened)?
    };
    let out = GpuTensor::new_allocation(g, shape.clone(), x.dtype());

    let sig = format!("r{rows}.c{c}.p{}", is_packed as u8);
    let pipeline = g.pipeline("rms_norm", sig, || shaders::rms_norm(rows, c, is_packed));
    dispatch(
        g,
        "rms_norm",
        &pipeline,
        &[x.buffer(), gamma_dense.buffer(), out.buffer()],
        rows,
        64,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

/// Two dispatches in one submission: per-row dx plus staged dgamma
/// contributions, then a per-column reduction of the stage buffer.
pub(crate) fn rms_norm_grad(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "rms_norm_grad")?;
    for input in inputs {
        require_dense("rms_norm_grad", input)?;
    }
    let shape = inputs[1].shape();
    let c = *shape.last().unwrap_or(&1);
    let rows: usize = shape[..shape.len() - 1].iter().product();

    let dy = ensure_device(g, "rms_norm_grad", &inputs[0])?;
    let x = ensure_device(g, "rms_norm_grad", &inputs[1])?;
    let gamma = ensure_device(g, "rms_norm_grad", &inputs[2])?;
    let dx = GpuTensor::new_allocation(g, shape.clone(), DType::F32);
    let partial = GpuTensor::new_allocation(g, vec![rows, c], DType::F32);
    let dgamma = GpuTensor::new_allocation(g, vec![c], DType::F32);

    let sig = format!("r{rows}.c{c}");
    let dx_pipeline = g.pipeline("rms_norm_grad_dx", sig.clone(), || {
        shaders::rms_norm_grad_dx(rows, c)
    });
    let reduce_pipeline = g.pipeline("rms_norm_grad_reduce", sig, || {
        shaders::rms_norm_grad_reduce(rows, c)
    });
    dispatch(
        g,
        "rms_norm_grad_dx",
        &dx_pipeline,
        &[
            dy.buffer(),
            x.buffer(),
            gamma.buffer(),
            dx.buffer(),
            partial.buffer(),
        ],
        rows,
        64,
    );
    dispatch(
        g,
        "rms_norm_grad_reduce",
        &reduce_pipeline,
        &[partial.buffer(), dgamma.buffer()],
        c,
        64,
    );
    Ok(vec![Tensor::from_gpu(dx), Tensor::from_gpu(dgamma)])
}

pub(crate) fn append_cache(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "append_cache")?;
    let max_size = attrs.usize("append_cache", "max_size")?;
    let past_len = attrs.usize_or("append_cache", "past_len", 0)?;
    let (_, _, ct, _) = inputs[0].dims4()?;
    let (b, h, _, d) = inputs[1].dims4()?;
    if ct != 0 && inputs[0].dtype() != inputs[1].dtype() {
        return Err(KernelError::packing(
            "append_cache",
            "cache and item must share one packing state on the accelerator",
        ));
    }
    let dtype = if ct == 0 {
        inputs[1].dtype()
    } else {
        inputs[0].dtype()
    };
    // Rows move as whole 4-byte words, so dense and packed share the shader.
    let words = super::tensor::storage_words(&[d], dtype);

    let shift = past_len >= max_size;
    let t_out = if shift {
        ct
    } else if ct == 0 {
        max_size
    } else {
        ct.max(past_len + 1).min(max_size)
    };

    let cache = ensure_device(g, "append_cache", &inputs[0])?;
    let item = ensure_device(g, "append_cache", &inputs[1])?;
    let out = GpuTensor::new_allocation(g, vec![b, h, t_out, d], dtype);
    let params = uniform(
        g,
        "cache-params",
        bytemuck::bytes_of(&PastLenParams {
            past_len: past_len as u32,
            pad: [0; 3],
        }),
    );
    let rows = b * h * t_out;
    let sig = format!("r{rows}.t{t_out}.ct{ct}.w{words}.s{}", shift as u8);
    let pipeline = g.pipeline("append_cache", sig, || {
        shaders::append_cache(rows, t_out, ct, words, shift)
    });
    dispatch(
        g,
        "append_cache",
        &pipeline,
        &[cache.buffer(), item.buffer(), out.buffer(), &params],
        rows,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn gather_sub(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "gather_sub")?;
    require_dense("gather_sub", &inputs[0])?;
    require_dense("gather_sub", &inputs[2])?;
    let b = inputs[0].shape()[0];
    let k = inputs[2].shape()[1];

    let values = ensure_device(g, "gather_sub", &inputs[0])?;
    let labels = ensure_device(g, "gather_sub", &inputs[1])?;
    let logits = ensure_device(g, "gather_sub", &inputs[2])?;
    let out = GpuTensor::new_allocation(g, vec![b], DType::F32);

    let sig = format!("b{b}.k{k}");
    let pipeline = g.pipeline("gather_sub", sig, || shaders::gather_sub(b, k));
    dispatch(
        g,
        "gather_sub",
        &pipeline,
        &[
            values.buffer(),
            labels.buffer(),
            logits.buffer(),
            out.buffer(),
        ],
        b,
        64,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn scatter_sub(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "scatter_sub")?;
    require_dense("scatter_sub", &inputs[0])?;
    require_dense("scatter_sub", &inputs[2])?;
    let (b, k) = {
        let s = inputs[0].shape();
        (s[0], s[1])
    };

    let probs = ensure_device(g, "scatter_sub", &inputs[0])?;
    let labels = ensure_device(g, "scatter_sub", &inputs[1])?;
    let dy = ensure_device(g, "scatter_sub", &inputs[2])?;
    let out = GpuTensor::new_allocation(g, vec![b, k], DType::F32);

    let sig = format!("b{b}.k{k}");
    let pipeline = g.pipeline("scatter_sub", sig, || shaders::scatter_sub(b, k));
    dispatch(
        g,
        "scatter_sub",
        &pipeline,
        &[probs.buffer(), labels.buffer(), dy.buffer(), out.buffer()],
        b * k,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn adam_moments(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "adam_moments")?;
    let beta1 = attrs.f32("adam_moments", "beta1")?;
    let beta2 = attrs.f32("adam_moments", "beta2")?;
    let n = inputs[1].num_elements();

    let moments = ensure_device(g, "adam_moments", &inputs[0])?;
    let grad = ensure_device(g, "adam_moments", &inputs[1])?;
    let out = GpuTensor::new_allocation(g, inputs[0].shape(), DType::PackedF16);
    let params = uniform(
        g,
        "adam-moment-params",
        bytemuck::bytes_of(&MomentParams {
            beta1,
            beta2,
            pad: [0; 2],
        }),
    );
    let sig = format!("n{n}");
    let pipeline = g.pipeline("adam_moments", sig, || shaders::adam_moments(n));
    dispatch(
        g,
        "adam_moments",
        &pipeline,
        &[moments.buffer(), grad.buffer(), out.buffer(), &params],
        n,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn adam_adjust(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    attrs: &Attributes,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, "adam_adjust")?;
    let params_host = AdjustParams {
        beta1: attrs.f32("adam_adjust", "beta1")?,
        beta2: attrs.f32("adam_adjust", "beta2")?,
        epsilon: attrs.f32("adam_adjust", "epsilon")?,
        lr: attrs.f32("adam_adjust", "learning_rate")?,
    };
    let n = inputs[1].num_elements();

    let moments = ensure_device(g, "adam_adjust", &inputs[0])?;
    let value = ensure_device(g, "adam_adjust", &inputs[1])?;
    let out = GpuTensor::new_allocation(g, inputs[1].shape(), DType::F32);
    let params = uniform(g, "adam-adjust-params", bytemuck::bytes_of(&params_host));

    let sig = format!("n{n}");
    let pipeline = g.pipeline("adam_adjust", sig, || shaders::adam_adjust(n));
    dispatch(
        g,
        "adam_adjust",
        &pipeline,
        &[moments.buffer(), value.buffer(), out.buffer(), &params],
        n,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}

pub(crate) fn binary(
    ctx: &KernelCtx<'_>,
    inputs: &[Tensor],
    _attrs: &Attributes,
    op: &'static str,
    symbol: char,
) -> KernelResult<Vec<Tensor>> {
    let g = device(ctx, op)?;
    if inputs[0].is_packed() != inputs[1].is_packed() {
        return Err(KernelError::packing(
            op,
            "accelerator elementwise kernels need both operands in one packing state",
        ));
    }
    let a = ensure_device(g, op, &inputs[0])?;
    let b = ensure_device(g, op, &inputs[1])?;
    let is_packed = inputs[0].is_packed();
    let words = a.storage_words();
    let out = GpuTensor::new_allocation(g, inputs[0].shape(), a.dtype());

    let sig = format!("w{words}.p{}", is_packed as u8);
    let pipeline = g.pipeline(op, sig, || shaders::binary(words, symbol, is_packed));
    dispatch(
        g,
        op,
        &pipeline,
        &[a.buffer(), b.buffer(), out.buffer()],
        words,
        256,
    );
    Ok(vec![Tensor::from_gpu(out)])
}
