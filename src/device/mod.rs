//! Execution devices.
//!
//! A device is either the host or an accelerator with its own memory space.
//! Accelerators are reached through the [`DeviceBackend`] trait; two backends
//! ship with the crate:
//! - [`SimulatedDevice`]: a worker-thread device with an in-order queue
//! - [`GpuDevice`]: a wgpu adapter

pub mod backend;
pub mod gpu;
pub mod handle;
pub mod registry;
pub mod simulated;

pub use backend::{DeviceBackend, DeviceCapabilities, DeviceKind, Kernel, SurfaceId};
pub use gpu::{GpuBackend, GpuDevice};
pub use handle::{DeviceId, ExecutionDevice};
pub use registry::{
    CriteriaMatcher, DefaultDevicePolicy, DeviceCapability, DeviceCriteria, DeviceRegistry,
    DeviceSelector, DeviceType,
};
pub use simulated::SimulatedDevice;
