//! Execution contexts.
//!
//! [`PipelineContext`] is the explicit object threaded through pipeline
//! construction: it owns the device registry, the engine configuration and
//! the advisory stop flag. [`ExecutionContext`] is what a stage body sees
//! while it runs.

use crate::config::EngineConfig;
use crate::core::error::{HeteroflowResult, PipelineError, PipelineResult, StageId};
use crate::core::port::PortDefinition;
use crate::core::types::DataKind;
use crate::data::{Data, Image, Mesh, PointSet};
use crate::device::{DeviceRegistry, ExecutionDevice, GpuDevice, SimulatedDevice};
use crate::execution::streaming::StreamingMode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Pipeline context
// ============================================================================

/// Shared state for every stage of one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    devices: Arc<DeviceRegistry>,
    config: Arc<EngineConfig>,
    stop: Arc<AtomicBool>,
}

impl PipelineContext {
    /// Create a context around an existing registry.
    pub fn new(devices: DeviceRegistry) -> Self {
        Self {
            devices: Arc::new(devices),
            config: Arc::new(EngineConfig::default()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the device registry described by `config`.
    pub fn from_config(config: &EngineConfig) -> HeteroflowResult<Self> {
        config.validate()?;
        let registry = DeviceRegistry::new(config.devices.default_policy);

        for device in &config.devices.simulated {
            registry.register(Arc::new(SimulatedDevice::with_capabilities(
                device.name.clone(),
                device.capabilities(),
            )));
        }
        if config.devices.probe_gpu {
            match GpuDevice::probe() {
                Some(gpu) => {
                    registry.register(Arc::new(gpu));
                }
                None => log::warn!("No GPU adapter available, continuing without one"),
            }
        }

        let context = Self {
            devices: Arc::new(registry),
            config: Arc::new(config.clone()),
            stop: Arc::new(AtomicBool::new(false)),
        };
        log::info!(
            "Pipeline context ready: {} devices, default {}",
            context.devices.len(),
            context.default_device()
        );
        Ok(context)
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The device new stages start on.
    pub fn default_device(&self) -> ExecutionDevice {
        self.devices.default_device()
    }

    /// Whether new stages measure their runtime.
    pub fn measure_runtime(&self) -> bool {
        self.config.runtime.measure
    }

    /// Ask long-running streaming work to stop. Advisory.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new(DeviceRegistry::default())
    }
}

// ============================================================================
// Execution context
// ============================================================================

struct InputValue {
    data: Data,
    modified: bool,
}

/// The view a stage body has of its stage during one execution.
///
/// Inputs are snapshots taken when the stage decided to execute; outputs set
/// here are installed into the stage's output slots only if the body
/// succeeds.
pub struct ExecutionContext {
    stage: StageId,
    stage_name: String,
    timestep: u64,
    mode: StreamingMode,
    inputs: BTreeMap<usize, InputValue>,
    previous_outputs: BTreeMap<usize, Data>,
    outputs: BTreeMap<usize, Data>,
    output_ports: BTreeMap<usize, PortDefinition>,
    devices: BTreeMap<usize, ExecutionDevice>,
    pipeline: PipelineContext,
}

impl ExecutionContext {
    pub(crate) fn new(
        stage: StageId,
        stage_name: impl Into<String>,
        timestep: u64,
        mode: StreamingMode,
        pipeline: PipelineContext,
    ) -> Self {
        Self {
            stage,
            stage_name: stage_name.into(),
            timestep,
            mode,
            inputs: BTreeMap::new(),
            previous_outputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            output_ports: BTreeMap::new(),
            devices: BTreeMap::new(),
            pipeline,
        }
    }

    pub(crate) fn add_input(&mut self, index: usize, data: Data, modified: bool) {
        self.inputs.insert(index, InputValue { data, modified });
    }

    pub(crate) fn add_output_port(&mut self, port: PortDefinition, previous: Option<Data>) {
        if let Some(data) = previous {
            self.previous_outputs.insert(port.index, data);
        }
        self.output_ports.insert(port.index, port);
    }

    pub(crate) fn add_device(&mut self, slot: usize, device: ExecutionDevice) {
        self.devices.insert(slot, device);
    }

    pub(crate) fn take_outputs(&mut self) -> BTreeMap<usize, Data> {
        std::mem::take(&mut self.outputs)
    }

    pub(crate) fn assigned_devices(&self) -> impl Iterator<Item = &ExecutionDevice> {
        self.devices.values()
    }

    pub fn stage_id(&self) -> StageId {
        self.stage
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// The timestep being computed.
    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    /// Streaming mode forwarded from the `update` call.
    pub fn streaming_mode(&self) -> StreamingMode {
        self.mode
    }

    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }

    pub fn is_stop_requested(&self) -> bool {
        self.pipeline.is_stop_requested()
    }

    /// Wrap a body failure so it names this stage.
    pub fn fail(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::execution(self.stage, message)
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Data on input `index`.
    pub fn input(&self, index: usize) -> PipelineResult<&Data> {
        self.inputs
            .get(&index)
            .map(|value| &value.data)
            .ok_or(PipelineError::MissingRequiredInput {
                stage: self.stage,
                port: index,
            })
    }

    /// Data on an optional input, if its producer has produced any.
    pub fn optional_input(&self, index: usize) -> Option<&Data> {
        self.inputs.get(&index).map(|value| &value.data)
    }

    /// Whether input `index` changed since this stage last executed.
    pub fn has_new_input_data(&self, index: usize) -> bool {
        self.inputs.get(&index).is_some_and(|value| value.modified)
    }

    pub fn input_image(&self, index: usize) -> PipelineResult<Arc<Image>> {
        let data = self.input(index)?;
        data.as_image().cloned().ok_or(PipelineError::TypeMismatch {
            expected: DataKind::Image,
            got: data.kind(),
        })
    }

    pub fn input_mesh(&self, index: usize) -> PipelineResult<Arc<Mesh>> {
        let data = self.input(index)?;
        data.as_mesh().cloned().ok_or(PipelineError::TypeMismatch {
            expected: DataKind::Mesh,
            got: data.kind(),
        })
    }

    pub fn input_point_set(&self, index: usize) -> PipelineResult<Arc<PointSet>> {
        let data = self.input(index)?;
        data.as_point_set().cloned().ok_or(PipelineError::TypeMismatch {
            expected: DataKind::PointSet,
            got: data.kind(),
        })
    }

    // ------------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------------

    /// Publish `data` on output `index`, replacing whatever the slot held.
    pub fn set_output(&mut self, index: usize, data: impl Into<Data>) -> PipelineResult<()> {
        let data = data.into();
        let port = self
            .output_ports
            .get(&index)
            .ok_or(PipelineError::PortNotFound {
                stage: self.stage,
                port: index,
                direction: crate::core::error::PortDirection::Output,
            })?;
        if !port.kind.accepts(data.kind()) {
            return Err(PipelineError::TypeMismatch {
                expected: port.kind,
                got: data.kind(),
            });
        }
        self.outputs.insert(index, data);
        Ok(())
    }

    /// What output `index` held before this execution.
    pub fn previous_output(&self, index: usize) -> Option<&Data> {
        self.previous_outputs.get(&index)
    }

    /// Create a fresh image and publish it on output `index`.
    pub fn output_image(&mut self, index: usize) -> PipelineResult<Arc<Image>> {
        let image = Arc::new(Image::new());
        self.set_output(index, Arc::clone(&image))?;
        Ok(image)
    }

    /// Create a fresh mesh and publish it on output `index`.
    pub fn output_mesh(&mut self, index: usize) -> PipelineResult<Arc<Mesh>> {
        let mesh = Arc::new(Mesh::new());
        self.set_output(index, Arc::clone(&mesh))?;
        Ok(mesh)
    }

    /// Create a fresh point set and publish it on output `index`.
    pub fn output_point_set(&mut self, index: usize) -> PipelineResult<Arc<PointSet>> {
        let points = Arc::new(PointSet::new());
        self.set_output(index, Arc::clone(&points))?;
        Ok(points)
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    /// Device assigned to `slot`.
    pub fn device(&self, slot: usize) -> PipelineResult<&ExecutionDevice> {
        self.devices
            .get(&slot)
            .ok_or(PipelineError::DeviceSlotNotFound {
                stage: self.stage,
                slot,
            })
    }

    /// Device assigned to slot 0.
    pub fn main_device(&self) -> PipelineResult<&ExecutionDevice> {
        self.device(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatedDeviceConfig;
    use crate::device::DefaultDevicePolicy;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            StageId::new(),
            "test",
            3,
            StreamingMode::NewestFrameOnly,
            PipelineContext::default(),
        );
        ctx.add_input(0, Image::new().into(), true);
        ctx.add_input(1, Mesh::new().into(), false);
        ctx.add_output_port(PortDefinition::output(0, DataKind::Image), None);
        ctx.add_device(0, ExecutionDevice::host());
        ctx
    }

    #[test]
    fn test_pipeline_context_from_config() {
        let config = EngineConfig::new()
            .with_default_policy(DefaultDevicePolicy::FirstAccelerator)
            .with_simulated_device(SimulatedDeviceConfig::new("sim-a"))
            .with_runtime_measurement(true);
        let context = PipelineContext::from_config(&config).unwrap();
        assert_eq!(context.devices().len(), 2);
        assert_eq!(context.default_device().name(), "sim-a");
        assert!(context.measure_runtime());

        context.request_stop();
        assert!(context.clone().is_stop_requested());
        context.clear_stop();
        assert!(!context.is_stop_requested());
    }

    #[test]
    fn test_input_getters() {
        let ctx = context();
        assert_eq!(ctx.timestep(), 3);
        assert_eq!(ctx.streaming_mode(), StreamingMode::NewestFrameOnly);
        assert!(ctx.input_image(0).is_ok());
        assert!(ctx.has_new_input_data(0));
        assert!(!ctx.has_new_input_data(1));
        assert!(matches!(
            ctx.input_image(1),
            Err(PipelineError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctx.input(2),
            Err(PipelineError::MissingRequiredInput { port: 2, .. })
        ));
        assert!(ctx.optional_input(2).is_none());
    }

    #[test]
    fn test_output_setters() {
        let mut ctx = context();
        assert!(ctx.output_image(0).is_ok());
        assert!(matches!(
            ctx.set_output(0, Mesh::new()),
            Err(PipelineError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctx.output_image(1),
            Err(PipelineError::PortNotFound { port: 1, .. })
        ));
        assert_eq!(ctx.take_outputs().len(), 1);
        assert!(ctx.main_device().unwrap().is_host());
        assert!(ctx.device(1).is_err());
    }
}
