//! Execution device handles.
//!
//! Devices are identified by a stable integer id. The host is always id 0;
//! accelerators draw ids from a process-wide counter, so two handles compare
//! equal exactly when they name the same device.

use crate::core::error::DeviceResult;
use crate::device::backend::{DeviceBackend, DeviceCapabilities, DeviceKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identity of an execution device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    /// The host device.
    pub const HOST: DeviceId = DeviceId(0);

    fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A host or accelerator target.
///
/// Cheap to clone. Equality and hashing use only the id.
#[derive(Clone)]
pub struct ExecutionDevice {
    id: DeviceId,
    backend: Option<Arc<dyn DeviceBackend>>,
}

impl ExecutionDevice {
    /// The host device.
    pub fn host() -> Self {
        Self {
            id: DeviceId::HOST,
            backend: None,
        }
    }

    /// Wrap an accelerator backend under a fresh id.
    pub fn accelerator(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            id: DeviceId::next(),
            backend: Some(backend),
        }
    }

    /// Device id.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Whether this is the host.
    pub fn is_host(&self) -> bool {
        self.backend.is_none()
    }

    /// Accelerator backend, `None` for the host.
    pub fn backend(&self) -> Option<&Arc<dyn DeviceBackend>> {
        self.backend.as_ref()
    }

    /// Device name.
    pub fn name(&self) -> &str {
        match &self.backend {
            Some(backend) => backend.name(),
            None => "host",
        }
    }

    /// Device capabilities. The host stores every channel count natively.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        static HOST_CAPS: OnceLock<DeviceCapabilities> = OnceLock::new();
        match &self.backend {
            Some(backend) => backend.capabilities(),
            None => HOST_CAPS.get_or_init(|| DeviceCapabilities {
                kind: DeviceKind::Cpu,
                surface_channels: vec![1, 2, 3, 4],
                peer_group: None,
                graphics_interop: false,
            }),
        }
    }

    /// Block until the device queue drains. No-op on the host.
    pub fn finish(&self) -> DeviceResult<()> {
        match &self.backend {
            Some(backend) => backend.finish(),
            None => Ok(()),
        }
    }
}

impl PartialEq for ExecutionDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExecutionDevice {}

impl Hash for ExecutionDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionDevice")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::SimulatedDevice;

    #[test]
    fn test_host_is_singleton_identity() {
        assert_eq!(ExecutionDevice::host(), ExecutionDevice::host());
        assert!(ExecutionDevice::host().is_host());
        assert!(ExecutionDevice::host().capabilities().supports_channels(3));
    }

    #[test]
    fn test_accelerators_compare_by_identity() {
        let backend: Arc<dyn DeviceBackend> = Arc::new(SimulatedDevice::new("sim"));
        let a = ExecutionDevice::accelerator(backend.clone());
        let b = ExecutionDevice::accelerator(backend);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(!a.is_host());
        assert_ne!(a.id(), DeviceId::HOST);
    }
}
