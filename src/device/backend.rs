//! The seam between the coherence store and an accelerator memory space.
//!
//! A backend owns device-resident surfaces addressed by [`SurfaceId`]. Uploads,
//! copies and kernels are enqueued on an in-order queue; downloads and
//! [`DeviceBackend::finish`] block until everything issued before them has
//! completed.

use crate::core::error::DeviceResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a device-resident surface, unique within one backend.
pub type SurfaceId = u64;

/// A kernel run in place over the bytes of one surface.
pub type Kernel = Box<dyn FnOnce(&mut [u8]) + Send + 'static>;

/// Broad class of an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Other => write!(f, "other"),
        }
    }
}

/// What a device can do, as far as the coherence store and criteria
/// matching are concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Accelerator class
    pub kind: DeviceKind,
    /// Channel counts a surface may have on this device
    pub surface_channels: Vec<u32>,
    /// Devices sharing a peer group have a direct device-to-device path
    pub peer_group: Option<u32>,
    /// Whether surfaces can be shared with a graphics context
    pub graphics_interop: bool,
}

impl DeviceCapabilities {
    /// Capabilities of a device supporting 1, 2 and 4 channel surfaces.
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            surface_channels: vec![1, 2, 4],
            peer_group: None,
            graphics_interop: false,
        }
    }

    /// Also support three-channel surfaces.
    pub fn with_three_channel_surfaces(mut self) -> Self {
        if !self.surface_channels.contains(&3) {
            self.surface_channels.push(3);
            self.surface_channels.sort_unstable();
        }
        self
    }

    /// Place the device in a peer group.
    pub fn with_peer_group(mut self, group: u32) -> Self {
        self.peer_group = Some(group);
        self
    }

    /// Mark the device as able to share surfaces with a graphics context.
    pub fn with_graphics_interop(mut self) -> Self {
        self.graphics_interop = true;
        self
    }

    /// Whether a surface with `channels` components can be stored as is.
    pub fn supports_channels(&self, channels: u32) -> bool {
        self.surface_channels.contains(&channels)
    }

    /// Whether a direct copy path exists between the two devices.
    pub fn is_peer_of(&self, other: &DeviceCapabilities) -> bool {
        matches!((self.peer_group, other.peer_group), (Some(a), Some(b)) if a == b)
    }
}

/// An accelerator memory space with an in-order command queue.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Allocate a zero-filled surface of `len` bytes.
    fn allocate(&self, len: usize) -> DeviceResult<SurfaceId>;

    /// Enqueue a host-to-device write covering the whole surface.
    fn upload(&self, surface: SurfaceId, bytes: Vec<u8>) -> DeviceResult<()>;

    /// Read a whole surface back. Blocks until queued work completes.
    fn download(&self, surface: SurfaceId) -> DeviceResult<Vec<u8>>;

    /// Enqueue a copy between two surfaces of this device.
    fn copy(&self, src: SurfaceId, dst: SurfaceId) -> DeviceResult<()>;

    /// Enqueue a kernel over one surface.
    fn dispatch(&self, surface: SurfaceId, kernel: Kernel) -> DeviceResult<()>;

    /// Release a surface.
    fn free(&self, surface: SurfaceId) -> DeviceResult<()>;

    /// Block until every queued command has completed.
    fn finish(&self) -> DeviceResult<()>;
}
