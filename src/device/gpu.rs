//! GPU device backed by wgpu.
//!
//! Surfaces are plain storage buffers. Uploads go through the queue and are
//! therefore ordered with later copies; downloads stage through a mappable
//! buffer and block on `device.poll(Maintain::Wait)`. Kernels run as a host
//! fallback (download, run, upload) because shader management lives outside
//! this crate.

use crate::core::error::{DeviceError, DeviceResult};
use crate::device::backend::{DeviceBackend, DeviceCapabilities, DeviceKind, Kernel, SurfaceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// GPU execution backend reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBackend {
    /// Vulkan (Linux, Windows)
    Vulkan,
    /// Metal (macOS)
    Metal,
    /// DirectX 12 (Windows)
    Dx12,
    /// OpenGL / GLES
    Gl,
    /// WebGPU (web)
    WebGpu,
    /// No usable backend
    None,
}

impl From<wgpu::Backend> for GpuBackend {
    fn from(backend: wgpu::Backend) -> Self {
        match backend {
            wgpu::Backend::Vulkan => GpuBackend::Vulkan,
            wgpu::Backend::Metal => GpuBackend::Metal,
            wgpu::Backend::Dx12 => GpuBackend::Dx12,
            wgpu::Backend::Gl => GpuBackend::Gl,
            wgpu::Backend::BrowserWebGpu => GpuBackend::WebGpu,
            _ => GpuBackend::None,
        }
    }
}

struct GpuSurface {
    buffer: wgpu::Buffer,
    /// Logical length; the buffer itself is rounded up to the copy alignment.
    len: usize,
}

/// A wgpu adapter exposed as an accelerator.
pub struct GpuDevice {
    name: String,
    backend: GpuBackend,
    capabilities: DeviceCapabilities,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surfaces: Mutex<HashMap<SurfaceId, GpuSurface>>,
    next_surface: AtomicU64,
}

fn aligned(len: usize) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    ((len as u64).max(1) + align - 1) / align * align
}

impl GpuDevice {
    /// Open the first suitable adapter.
    ///
    /// Returns None if no adapter or device is available.
    pub fn probe() -> Option<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;

        let info = adapter.get_info();
        let (device, queue): (wgpu::Device, wgpu::Queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("heteroflow"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| log::warn!("GPU adapter {} refused a device: {}", info.name, e))
        .ok()?;

        let kind = match info.device_type {
            wgpu::DeviceType::Cpu => DeviceKind::Cpu,
            wgpu::DeviceType::Other => DeviceKind::Other,
            _ => DeviceKind::Gpu,
        };

        log::info!("Opened GPU adapter {} ({:?})", info.name, info.backend);

        Some(Self {
            name: info.name.clone(),
            backend: info.backend.into(),
            capabilities: DeviceCapabilities::new(kind),
            device,
            queue,
            surfaces: Mutex::new(HashMap::new()),
            next_surface: AtomicU64::new(1),
        })
    }

    /// Get the backend being used.
    pub fn backend(&self) -> GpuBackend {
        self.backend
    }

    fn buffer_len(&self, surface: SurfaceId) -> DeviceResult<usize> {
        self.surfaces
            .lock()
            .get(&surface)
            .map(|s| s.len)
            .ok_or(DeviceError::SurfaceNotFound(surface))
    }
}

impl DeviceBackend for GpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn allocate(&self, len: usize) -> DeviceResult<SurfaceId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("heteroflow-surface"),
            size: aligned(len),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let surface = self.next_surface.fetch_add(1, Ordering::Relaxed);
        self.surfaces.lock().insert(surface, GpuSurface { buffer, len });
        Ok(surface)
    }

    fn upload(&self, surface: SurfaceId, mut bytes: Vec<u8>) -> DeviceResult<()> {
        let surfaces = self.surfaces.lock();
        let target = surfaces.get(&surface).ok_or(DeviceError::SurfaceNotFound(surface))?;
        if target.len != bytes.len() {
            return Err(DeviceError::SizeMismatch {
                expected: target.len,
                got: bytes.len(),
            });
        }
        bytes.resize(aligned(bytes.len()) as usize, 0);
        self.queue.write_buffer(&target.buffer, 0, &bytes);
        Ok(())
    }

    fn download(&self, surface: SurfaceId) -> DeviceResult<Vec<u8>> {
        let len = self.buffer_len(surface)?;
        let size = aligned(len);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("heteroflow-readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        {
            let surfaces = self.surfaces.lock();
            let source = surfaces.get(&surface).ok_or(DeviceError::SurfaceNotFound(surface))?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("heteroflow-download"),
                });
            encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
            self.queue.submit(std::iter::once(encoder.finish()));
        }

        let slice = staging.slice(..);
        let (sender, receiver) = crossbeam::channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        let transfer_failed = |reason: String| DeviceError::TransferFailed {
            device: self.name.clone(),
            reason,
        };
        receiver
            .recv()
            .map_err(|e| transfer_failed(e.to_string()))?
            .map_err(|e| transfer_failed(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let bytes = mapped[..len].to_vec();
        drop(mapped);
        staging.unmap();
        Ok(bytes)
    }

    fn copy(&self, src: SurfaceId, dst: SurfaceId) -> DeviceResult<()> {
        let surfaces = self.surfaces.lock();
        let source = surfaces.get(&src).ok_or(DeviceError::SurfaceNotFound(src))?;
        let target = surfaces.get(&dst).ok_or(DeviceError::SurfaceNotFound(dst))?;
        if source.len != target.len {
            return Err(DeviceError::SizeMismatch {
                expected: target.len,
                got: source.len,
            });
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("heteroflow-copy"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &target.buffer, 0, aligned(source.len));
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn dispatch(&self, surface: SurfaceId, kernel: Kernel) -> DeviceResult<()> {
        let mut bytes = self.download(surface)?;
        kernel(bytes.as_mut_slice());
        self.upload(surface, bytes)
    }

    fn free(&self, surface: SurfaceId) -> DeviceResult<()> {
        let removed = self
            .surfaces
            .lock()
            .remove(&surface)
            .ok_or(DeviceError::SurfaceNotFound(surface))?;
        removed.buffer.destroy();
        Ok(())
    }

    fn finish(&self) -> DeviceResult<()> {
        self.queue.submit(std::iter::empty::<wgpu::CommandBuffer>());
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .finish()
    }
}
