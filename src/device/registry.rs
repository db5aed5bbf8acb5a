//! Device arena, default-device policy and criteria matching.
//!
//! The registry is the explicit replacement for a process-wide device
//! manager: it is built once per [`PipelineContext`](crate::execution::PipelineContext)
//! and handed to every stage created from that context.

use crate::core::error::{PipelineError, PipelineResult};
use crate::device::backend::{DeviceBackend, DeviceKind};
use crate::device::handle::{DeviceId, ExecutionDevice};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How the default compute device is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultDevicePolicy {
    /// Always the host.
    #[default]
    Host,
    /// The first registered accelerator, else the host.
    FirstAccelerator,
    /// The first GPU-kind accelerator, else the first accelerator, else the host.
    PreferGpu,
}

/// Device type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Any,
    Host,
    /// Any device that is not the host.
    Accelerator,
    Gpu,
    /// The host or a CPU-kind accelerator.
    Cpu,
}

/// A capability a device must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCapability {
    /// Surfaces can be shared with a graphics context.
    GraphicsInterop,
    /// Surfaces with this many channels are stored natively.
    SurfaceChannels(u32),
    /// Direct device-to-device path to peers.
    PeerToPeer,
}

/// Opaque filter over devices: type, capabilities and count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCriteria {
    pub device_type: DeviceType,
    pub capabilities: Vec<DeviceCapability>,
    /// Number of devices wanted, `None` for all matching devices
    pub count: Option<usize>,
}

impl DeviceCriteria {
    /// Criteria matching any device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the device type.
    pub fn with_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Require a capability.
    pub fn with_capability(mut self, capability: DeviceCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Ask for exactly `count` devices.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Whether a single device passes the type and capability filters.
    pub fn matches(&self, device: &ExecutionDevice) -> bool {
        let caps = device.capabilities();
        let type_ok = match self.device_type {
            DeviceType::Any => true,
            DeviceType::Host => device.is_host(),
            DeviceType::Accelerator => !device.is_host(),
            DeviceType::Gpu => !device.is_host() && caps.kind == DeviceKind::Gpu,
            DeviceType::Cpu => device.is_host() || caps.kind == DeviceKind::Cpu,
        };
        type_ok
            && self.capabilities.iter().all(|capability| match capability {
                DeviceCapability::GraphicsInterop => caps.graphics_interop,
                DeviceCapability::SurfaceChannels(n) => caps.supports_channels(*n),
                DeviceCapability::PeerToPeer => caps.peer_group.is_some(),
            })
    }
}

/// Picks devices for a set of criteria.
pub trait DeviceSelector: Send + Sync {
    /// Return the selected devices, or [`PipelineError::NoMatchingDevice`].
    fn select(
        &self,
        devices: &[ExecutionDevice],
        criteria: &DeviceCriteria,
    ) -> PipelineResult<Vec<ExecutionDevice>>;
}

/// Plain criteria matching in registration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriteriaMatcher;

impl DeviceSelector for CriteriaMatcher {
    fn select(
        &self,
        devices: &[ExecutionDevice],
        criteria: &DeviceCriteria,
    ) -> PipelineResult<Vec<ExecutionDevice>> {
        let matching: Vec<ExecutionDevice> = devices
            .iter()
            .filter(|d| criteria.matches(d))
            .cloned()
            .collect();

        match criteria.count {
            Some(count) if matching.len() < count => Err(PipelineError::NoMatchingDevice),
            Some(count) => Ok(matching.into_iter().take(count).collect()),
            None if matching.is_empty() => Err(PipelineError::NoMatchingDevice),
            None => Ok(matching),
        }
    }
}

/// Arena of every device known to one pipeline context.
pub struct DeviceRegistry {
    devices: RwLock<Vec<ExecutionDevice>>,
    policy: RwLock<DefaultDevicePolicy>,
    selector: Box<dyn DeviceSelector>,
}

impl DeviceRegistry {
    /// Create a registry containing only the host.
    pub fn new(policy: DefaultDevicePolicy) -> Self {
        Self {
            devices: RwLock::new(vec![ExecutionDevice::host()]),
            policy: RwLock::new(policy),
            selector: Box::new(CriteriaMatcher),
        }
    }

    /// Use a custom device selector.
    pub fn with_selector(mut self, selector: impl DeviceSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    /// Register an accelerator and return its handle.
    pub fn register(&self, backend: Arc<dyn DeviceBackend>) -> ExecutionDevice {
        let device = ExecutionDevice::accelerator(backend);
        log::info!(
            "Registered device {} (kind {})",
            device,
            device.capabilities().kind
        );
        self.devices.write().push(device.clone());
        device
    }

    /// The host device.
    pub fn host(&self) -> ExecutionDevice {
        ExecutionDevice::host()
    }

    /// Every registered device, host first.
    pub fn devices(&self) -> Vec<ExecutionDevice> {
        self.devices.read().clone()
    }

    /// Number of registered devices, host included.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Always false: the host is always registered.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Look up a device by id.
    pub fn get(&self, id: DeviceId) -> Option<ExecutionDevice> {
        self.devices.read().iter().find(|d| d.id() == id).cloned()
    }

    /// Current default-device policy.
    pub fn policy(&self) -> DefaultDevicePolicy {
        *self.policy.read()
    }

    /// Change the default-device policy.
    pub fn set_policy(&self, policy: DefaultDevicePolicy) {
        *self.policy.write() = policy;
    }

    /// The default compute device under the current policy.
    pub fn default_device(&self) -> ExecutionDevice {
        let devices = self.devices.read();
        let mut accelerators = devices.iter().filter(|d| !d.is_host());
        let chosen = match self.policy() {
            DefaultDevicePolicy::Host => None,
            DefaultDevicePolicy::FirstAccelerator => accelerators.next(),
            DefaultDevicePolicy::PreferGpu => devices
                .iter()
                .find(|d| !d.is_host() && d.capabilities().kind == DeviceKind::Gpu)
                .or_else(|| accelerators.next()),
        };
        chosen.cloned().unwrap_or_else(ExecutionDevice::host)
    }

    /// Select devices matching `criteria`.
    pub fn select(&self, criteria: &DeviceCriteria) -> PipelineResult<Vec<ExecutionDevice>> {
        let devices = self.devices.read();
        self.selector.select(&devices, criteria)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DefaultDevicePolicy::default())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &*self.devices.read())
            .field("policy", &self.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::backend::DeviceCapabilities;
    use crate::device::simulated::SimulatedDevice;

    fn registry_with(kinds: &[DeviceKind]) -> DeviceRegistry {
        let registry = DeviceRegistry::new(DefaultDevicePolicy::Host);
        for (i, kind) in kinds.iter().enumerate() {
            registry.register(Arc::new(SimulatedDevice::with_capabilities(
                format!("sim{}", i),
                DeviceCapabilities::new(*kind),
            )));
        }
        registry
    }

    #[test]
    fn test_default_policies() {
        let registry = registry_with(&[DeviceKind::Cpu, DeviceKind::Gpu]);
        assert!(registry.default_device().is_host());

        registry.set_policy(DefaultDevicePolicy::FirstAccelerator);
        assert_eq!(registry.default_device().name(), "sim0");

        registry.set_policy(DefaultDevicePolicy::PreferGpu);
        assert_eq!(registry.default_device().name(), "sim1");
    }

    #[test]
    fn test_prefer_gpu_falls_back() {
        let registry = registry_with(&[]);
        registry.set_policy(DefaultDevicePolicy::PreferGpu);
        assert!(registry.default_device().is_host());
    }

    #[test]
    fn test_criteria_matching() {
        let registry = registry_with(&[DeviceKind::Gpu, DeviceKind::Gpu, DeviceKind::Cpu]);

        let gpus = registry
            .select(&DeviceCriteria::new().with_type(DeviceType::Gpu))
            .unwrap();
        assert_eq!(gpus.len(), 2);

        let cpus = registry
            .select(&DeviceCriteria::new().with_type(DeviceType::Cpu))
            .unwrap();
        assert_eq!(cpus.len(), 2);
        assert!(cpus[0].is_host());

        let one = registry
            .select(&DeviceCriteria::new().with_type(DeviceType::Gpu).with_count(1))
            .unwrap();
        assert_eq!(one.len(), 1);

        assert!(matches!(
            registry.select(&DeviceCriteria::new().with_type(DeviceType::Gpu).with_count(3)),
            Err(PipelineError::NoMatchingDevice)
        ));
        assert!(matches!(
            registry.select(
                &DeviceCriteria::new().with_capability(DeviceCapability::GraphicsInterop)
            ),
            Err(PipelineError::NoMatchingDevice)
        ));
    }
}
