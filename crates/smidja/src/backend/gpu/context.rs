//! Device context for the accelerator backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

/// Owns the wgpu device/queue pair plus the compiled-pipeline cache.
/// Created once and shared by every accelerator kernel via `Arc`.
#[derive(Debug)]
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub limits: wgpu::Limits,
    /// Compiled compute pipelines keyed by (operator, specialization
    /// signature). Identical specializations reuse the compiled module.
    pipelines: Mutex<HashMap<(&'static str, String), Arc<wgpu::ComputePipeline>>>,
}

/// Adapter selection knobs, deserializable from engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GpuConfig {
    pub power_preference: PowerPref,
    pub force_fallback_adapter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerPref {
    Low,
    High,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPref::High,
            force_fallback_adapter: false,
        }
    }
}

impl WgpuContext {
    pub async fn new() -> Result<Self> {
        Self::with_config(&GpuConfig::default()).await
    }

    pub async fn with_config(config: &GpuConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: match config.power_preference {
                    PowerPref::Low => wgpu::PowerPreference::LowPower,
                    PowerPref::High => wgpu::PowerPreference::HighPerformance,
                },
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .context("no compatible GPU adapter found")?;

        let info = adapter.get_info();
        log::info!(
            "accelerator adapter: {} ({:?}, {:?})",
            info.name,
            info.device_type,
            info.backend
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("smidja-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    // qkv and rms_norm_grad_dx bind 5 storage buffers
                    max_storage_buffers_per_shader_stage: 5,
                    ..wgpu::Limits::downlevel_defaults()
                },
                ..Default::default()
            })
            .await
            .context("failed to acquire GPU device")?;

        let limits = device.limits();
        log::debug!(
            "device limits: max buffer {} bytes, max workgroups {}",
            limits.max_buffer_size,
            limits.max_compute_workgroups_per_dimension
        );

        Ok(Self {
            device,
            queue,
            limits,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the compiled pipeline for `(op, signature)`, compiling the
    /// generated WGSL on first use. The bind group layout is derived from
    /// the shader, so callers bind by index order.
    pub fn pipeline(
        &self,
        op: &'static str,
        signature: String,
        source: impl FnOnce() -> String,
    ) -> Arc<wgpu::ComputePipeline> {
        let mut cache = self.pipelines.lock().expect("pipeline cache poisoned");
        if let Some(p) = cache.get(&(op, signature.clone())) {
            return Arc::clone(p);
        }

        let code = source();
        log::debug!("compiling `{op}` pipeline for signature {signature}");
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(op),
                source: wgpu::ShaderSource::Wgsl(code.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(op),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        let pipeline = Arc::new(pipeline);
        cache.insert((op, signature), Arc::clone(&pipeline));
        pipeline
    }

    #[cfg(test)]
    pub(crate) fn cached_pipelines(&self) -> usize {
        self.pipelines.lock().expect("pipeline cache poisoned").len()
    }
}
