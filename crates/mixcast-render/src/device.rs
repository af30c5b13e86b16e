// crates/mixcast-render/src/device.rs
//
// Headless wgpu bring-up. No surface, no window — the compositor renders
// into its own textures and reads them back.
//
// Everything created from this device is owned by the render thread. The
// handles are Send, but mixcast never lets another thread touch them;
// keeping GPU work single-threaded is what lets the compositor run a
// plain push/pop state model with no cross-thread hazards.

use mixcast_core::{log_info, MixError};

pub struct RenderDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl RenderDevice {
    /// Instance → adapter → device. Any failure here is fatal to the run
    /// (OutOfResources) — there is no software fallback worth streaming
    /// from that wgpu would not already have offered as an adapter.
    pub fn create() -> Result<Self, MixError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| MixError::OutOfResources(format!("no gpu adapter: {e}")))?;

        let info = adapter.get_info();
        log_info!("render device: {} ({:?})", info.name, info.backend);

        let limits = wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits());

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("mixcast render device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| MixError::OutOfResources(format!("gpu device creation failed: {e}")))?;

        Ok(Self { device, queue })
    }
}
