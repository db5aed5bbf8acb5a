//! Pipeline stages and the lazy update scheduler.
//!
//! A [`Stage`] wraps a [`ProcessObject`] body with the bookkeeping the
//! scheduler needs: input ports, output slots, device slots, the
//! self-modified flag and the last timestep it was updated for.
//!
//! `update(timestep)` walks upstream depth-first on the calling thread, then
//! executes the body only if the stage was marked modified, is a streaming
//! source, or one of its input ports observed a new timestamp.

use crate::core::error::{PipelineError, PipelineResult, PortDirection, StageId};
use crate::core::port::{PortDefinition, StagePorts};
use crate::data::{Data, Retention};
use crate::device::{DeviceCriteria, ExecutionDevice};
use crate::execution::context::{ExecutionContext, PipelineContext};
use crate::execution::runtime::{RuntimeManager, RuntimeMeasurement};
use crate::execution::streaming::StreamingMode;
use crate::graph::connection::Port;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Name under which execution times are recorded.
pub const EXECUTE_TIMING: &str = "execute";

// ============================================================================
// Stage body
// ============================================================================

/// The algorithm a stage runs.
///
/// Bodies never see the scheduler; they read inputs from and publish outputs
/// to the [`ExecutionContext`] they are handed.
pub trait ProcessObject: Send + 'static {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Input and output ports. Queried once when the stage is created.
    fn ports(&self) -> StagePorts;

    /// Runs before [`ProcessObject::execute`].
    fn pre_execute(&mut self, _ctx: &mut ExecutionContext) -> PipelineResult<()> {
        Ok(())
    }

    /// The stage-specific work.
    fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()>;

    /// Runs after a successful [`ProcessObject::execute`].
    fn post_execute(&mut self, _ctx: &mut ExecutionContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Streaming sources produce a new frame on every timestep.
    fn is_streaming(&self) -> bool {
        false
    }
}

/// Where a stage is in its current `update` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Idle,
    Updating,
    Executing,
    Done,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageStatus::Idle => "idle",
            StageStatus::Updating => "updating",
            StageStatus::Executing => "executing",
            StageStatus::Done => "done",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Stage state
// ============================================================================

struct InputSlot {
    definition: PortDefinition,
    connection: Option<Port>,
    /// Data consumed by the last execution, retained on the slot's device.
    retained: Option<(Data, Retention)>,
    release_after_execute: bool,
}

struct OutputSlot {
    definition: PortDefinition,
    data: Option<Data>,
}

struct StageState {
    status: StageStatus,
    modified: bool,
    last_timestep: Option<u64>,
    executions: u64,
    inputs: BTreeMap<usize, InputSlot>,
    outputs: BTreeMap<usize, OutputSlot>,
    devices: BTreeMap<usize, ExecutionDevice>,
    criteria: HashMap<usize, DeviceCriteria>,
}

impl StageState {
    fn producers(&self) -> Vec<Stage> {
        self.inputs
            .values()
            .filter_map(|slot| slot.connection.as_ref().map(|port| port.producer().clone()))
            .collect()
    }
}

struct StageInner {
    id: StageId,
    name: String,
    streaming: bool,
    body: Mutex<Box<dyn ProcessObject>>,
    /// Serialises updates; re-entrant so a body may pull its own stage.
    update_lock: ReentrantMutex<()>,
    state: Mutex<StageState>,
    context: PipelineContext,
    runtime: RuntimeManager,
}

// ============================================================================
// Stage handle
// ============================================================================

/// A node of the pipeline graph. Cheap to clone; clones share the stage.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Create a stage running `body` within `context`.
    ///
    /// The stage starts modified, so its first `update` executes it. Every
    /// device slot named by its ports starts on the context's default device.
    pub fn new(body: impl ProcessObject, context: &PipelineContext) -> Self {
        Self::from_boxed(Box::new(body), context)
    }

    /// Create a stage from an already boxed body.
    pub fn from_boxed(body: Box<dyn ProcessObject>, context: &PipelineContext) -> Self {
        let ports = body.ports();
        let default_device = context.default_device();

        let mut devices = BTreeMap::new();
        devices.insert(0, default_device.clone());
        for port in &ports.inputs {
            devices
                .entry(port.device_slot)
                .or_insert_with(|| default_device.clone());
        }

        let inputs = ports
            .inputs
            .into_iter()
            .map(|definition| {
                (
                    definition.index,
                    InputSlot {
                        definition,
                        connection: None,
                        retained: None,
                        release_after_execute: false,
                    },
                )
            })
            .collect();
        let outputs = ports
            .outputs
            .into_iter()
            .map(|definition| (definition.index, OutputSlot { definition, data: None }))
            .collect();

        let runtime = RuntimeManager::new();
        if context.measure_runtime() {
            runtime.enable();
        }

        Self {
            inner: Arc::new(StageInner {
                id: StageId::new(),
                name: body.name().to_string(),
                streaming: body.is_streaming(),
                body: Mutex::new(body),
                update_lock: ReentrantMutex::new(()),
                state: Mutex::new(StageState {
                    status: StageStatus::Idle,
                    modified: true,
                    last_timestep: None,
                    executions: 0,
                    inputs,
                    outputs,
                    devices,
                    criteria: HashMap::new(),
                }),
                context: context.clone(),
                runtime,
            }),
        }
    }

    pub fn id(&self) -> StageId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the body is a streaming source.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.context
    }

    pub fn status(&self) -> StageStatus {
        self.inner.state.lock().status
    }

    /// Number of successful executions so far.
    pub fn execution_count(&self) -> u64 {
        self.inner.state.lock().executions
    }

    /// Timestep of the last `update` call, if any.
    pub fn last_timestep(&self) -> Option<u64> {
        self.inner.state.lock().last_timestep
    }

    /// Force (or cancel) re-execution on the next `update`.
    pub fn set_modified(&self, modified: bool) {
        self.inner.state.lock().modified = modified;
    }

    pub fn is_modified(&self) -> bool {
        self.inner.state.lock().modified
    }

    // ------------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------------

    pub fn input_count(&self) -> usize {
        self.inner.state.lock().inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.inner.state.lock().outputs.len()
    }

    pub fn input_definitions(&self) -> Vec<PortDefinition> {
        let state = self.inner.state.lock();
        state.inputs.values().map(|s| s.definition.clone()).collect()
    }

    pub fn output_definitions(&self) -> Vec<PortDefinition> {
        let state = self.inner.state.lock();
        state.outputs.values().map(|s| s.definition.clone()).collect()
    }

    fn output_definition(&self, index: usize) -> PipelineResult<PortDefinition> {
        let state = self.inner.state.lock();
        state
            .outputs
            .get(&index)
            .map(|slot| slot.definition.clone())
            .ok_or(PipelineError::PortNotFound {
                stage: self.id(),
                port: index,
                direction: PortDirection::Output,
            })
    }

    /// Connect input `index` to `port`.
    ///
    /// The port's seen-timestamp is reset and this stage is marked modified.
    pub fn set_input_connection(&self, index: usize, port: Port) -> PipelineResult<()> {
        let produced = port.producer().output_definition(port.output_index())?;

        let mut state = self.inner.state.lock();
        let slot = state
            .inputs
            .get_mut(&index)
            .ok_or(PipelineError::PortNotFound {
                stage: self.inner.id,
                port: index,
                direction: PortDirection::Input,
            })?;
        if !slot.definition.kind.accepts(produced.kind) {
            return Err(PipelineError::TypeMismatch {
                expected: slot.definition.kind,
                got: produced.kind,
            });
        }

        let mut port = port;
        port.reset();
        log::debug!("Connected {} to input {} of {}", port, index, self);
        slot.connection = Some(port);
        state.modified = true;
        Ok(())
    }

    /// Feed a fixed data object into input `index`.
    ///
    /// The object is wrapped in a [`crate::stages::DataSource`] stage.
    pub fn set_input_data(&self, index: usize, data: impl Into<Data>) -> PipelineResult<()> {
        let source = Stage::new(
            crate::stages::DataSource::new(data),
            &self.inner.context,
        );
        self.set_input_connection(index, source.get_output_port(0)?)
    }

    /// Remove the connection on input `index`.
    pub fn disconnect_input(&self, index: usize) -> Option<Port> {
        let mut state = self.inner.state.lock();
        let port = state.inputs.get_mut(&index)?.connection.take();
        if port.is_some() {
            state.modified = true;
        }
        port
    }

    /// The port currently connected to input `index`.
    pub fn input_connection(&self, index: usize) -> Option<Port> {
        let state = self.inner.state.lock();
        state.inputs.get(&index)?.connection.clone()
    }

    /// Stages feeding this one, in input order.
    pub fn producers(&self) -> Vec<Stage> {
        self.inner.state.lock().producers()
    }

    /// Required inputs with no connection.
    pub fn unconnected_required_inputs(&self) -> Vec<usize> {
        let state = self.inner.state.lock();
        state
            .inputs
            .values()
            .filter(|slot| slot.definition.is_required() && slot.connection.is_none())
            .map(|slot| slot.definition.index)
            .collect()
    }

    /// A port on output `index`.
    pub fn get_output_port(&self, index: usize) -> PipelineResult<Port> {
        self.output_definition(index)?;
        Ok(Port::new(self.clone(), index))
    }

    /// What output `index` currently holds.
    pub fn output_data(&self, index: usize) -> PipelineResult<Data> {
        let state = self.inner.state.lock();
        let slot = state.outputs.get(&index).ok_or(PipelineError::PortNotFound {
            stage: self.inner.id,
            port: index,
            direction: PortDirection::Output,
        })?;
        slot.data.clone().ok_or(PipelineError::NoOutputProduced {
            stage: self.inner.id,
            port: index,
        })
    }

    /// Drop the retention on input `index` after each execution instead of
    /// holding it until the next one.
    pub fn release_input_after_execute(&self, index: usize, release: bool) -> PipelineResult<()> {
        let mut state = self.inner.state.lock();
        let slot = state
            .inputs
            .get_mut(&index)
            .ok_or(PipelineError::PortNotFound {
                stage: self.inner.id,
                port: index,
                direction: PortDirection::Input,
            })?;
        slot.release_after_execute = release;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    /// Assign `device` to `slot`.
    ///
    /// Data retained by inputs consumed on that slot is re-retained on the new
    /// device. Its coherence state is left untouched.
    pub fn set_device(&self, slot: usize, device: ExecutionDevice) -> PipelineResult<()> {
        let mut state = self.inner.state.lock();
        if let Some(criteria) = state.criteria.get(&slot) {
            if !criteria.matches(&device) {
                return Err(PipelineError::CriteriaNotSatisfied {
                    stage: self.inner.id,
                    slot,
                    device: device.name().to_string(),
                });
            }
        }

        let previous = state.devices.insert(slot, device.clone());
        if previous.is_some_and(|previous| previous != device) {
            for input in state
                .inputs
                .values_mut()
                .filter(|input| input.definition.device_slot == slot)
            {
                if let Some((data, old)) = input.retained.take() {
                    let retention = data.object().retain(&device);
                    drop(old);
                    input.retained = Some((data, retention));
                }
            }
            log::debug!("Stage {} moved slot {} to {}", self, slot, device);
        }
        Ok(())
    }

    pub fn set_main_device(&self, device: ExecutionDevice) -> PipelineResult<()> {
        self.set_device(0, device)
    }

    /// Constrain `slot` to devices matching `criteria` and assign the first
    /// one the context's selector returns.
    pub fn set_device_criteria(&self, slot: usize, criteria: DeviceCriteria) -> PipelineResult<()> {
        let device = self
            .inner
            .context
            .devices()
            .select(&criteria)?
            .into_iter()
            .next()
            .ok_or(PipelineError::NoMatchingDevice)?;
        self.inner.state.lock().criteria.insert(slot, criteria);
        self.set_device(slot, device)
    }

    pub fn set_main_device_criteria(&self, criteria: DeviceCriteria) -> PipelineResult<()> {
        self.set_device_criteria(0, criteria)
    }

    pub fn device(&self, slot: usize) -> PipelineResult<ExecutionDevice> {
        let state = self.inner.state.lock();
        state
            .devices
            .get(&slot)
            .cloned()
            .ok_or(PipelineError::DeviceSlotNotFound {
                stage: self.inner.id,
                slot,
            })
    }

    pub fn main_device(&self) -> PipelineResult<ExecutionDevice> {
        self.device(0)
    }

    // ------------------------------------------------------------------------
    // Runtime measurement
    // ------------------------------------------------------------------------

    pub fn enable_runtime_measurements(&self) {
        self.inner.runtime.enable();
    }

    pub fn disable_runtime_measurements(&self) {
        self.inner.runtime.disable();
    }

    /// Accumulated execution times, if any were recorded.
    pub fn runtime(&self) -> Option<RuntimeMeasurement> {
        self.inner.runtime.timing(EXECUTE_TIMING)
    }

    pub fn runtime_manager(&self) -> &RuntimeManager {
        &self.inner.runtime
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Bring this stage up to date for `timestep`.
    ///
    /// Producers are updated first. A second call for the same timestep is a
    /// no-op. `mode` is forwarded untouched to every body.
    pub fn update(&self, timestep: u64, mode: StreamingMode) -> PipelineResult<()> {
        let mut path = Vec::new();
        self.update_on_path(timestep, mode, &mut path)
    }

    fn update_on_path(
        &self,
        timestep: u64,
        mode: StreamingMode,
        path: &mut Vec<StageId>,
    ) -> PipelineResult<()> {
        if let Some(start) = path.iter().position(|id| *id == self.inner.id) {
            let stages = path[start..].to_vec();
            log::debug!("Cycle detected through stage {}", self);
            return Err(PipelineError::CycleDetected { stages });
        }

        let _serial = self.inner.update_lock.lock();

        let producers = {
            let mut state = self.inner.state.lock();
            if state.last_timestep == Some(timestep) {
                log::trace!("Stage {} already updated for timestep {}", self, timestep);
                return Ok(());
            }
            state.last_timestep = Some(timestep);
            state.status = StageStatus::Updating;
            state.producers()
        };

        path.push(self.inner.id);
        let upstream = producers
            .iter()
            .try_for_each(|producer| producer.update_on_path(timestep, mode, path));
        path.pop();
        if let Err(err) = upstream {
            self.inner.state.lock().status = StageStatus::Done;
            return Err(err);
        }

        match self.prepare(timestep, mode)? {
            Some(ctx) => self.run(ctx),
            None => Ok(()),
        }
    }

    /// Decide whether to execute and, if so, snapshot the inputs.
    fn prepare(
        &self,
        timestep: u64,
        mode: StreamingMode,
    ) -> PipelineResult<Option<ExecutionContext>> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        // One read of every producer slot; the decision, the context and the
        // seen-timestamps all come from this snapshot.
        let snapshot: BTreeMap<usize, (Data, u64)> = state
            .inputs
            .iter()
            .filter_map(|(index, slot)| {
                let data = slot.connection.as_ref()?.get_data().ok()?;
                let timestamp = data.timestamp();
                Some((*index, (data, timestamp)))
            })
            .collect();
        let modified_inputs: Vec<usize> = snapshot
            .iter()
            .filter(|(index, (_, timestamp))| {
                state
                    .inputs
                    .get(index)
                    .and_then(|slot| slot.connection.as_ref())
                    .is_some_and(|port| port.last_seen() != *timestamp)
            })
            .map(|(index, _)| *index)
            .collect();
        let should_execute = state.modified || self.inner.streaming || !modified_inputs.is_empty();

        if !should_execute {
            state.status = StageStatus::Done;
            log::trace!("Stage {} unchanged at timestep {}", self, timestep);
            return Ok(None);
        }

        if let Some(missing) = state.inputs.values().find(|slot| {
            slot.definition.is_required() && !snapshot.contains_key(&slot.definition.index)
        }) {
            let port = missing.definition.index;
            state.status = StageStatus::Done;
            return Err(PipelineError::MissingRequiredInput {
                stage: self.inner.id,
                port,
            });
        }

        let mut ctx = ExecutionContext::new(
            self.inner.id,
            self.inner.name.clone(),
            timestep,
            mode,
            self.inner.context.clone(),
        );
        for (index, slot) in state.inputs.iter_mut() {
            let (Some(port), Some((data, timestamp))) =
                (slot.connection.as_mut(), snapshot.get(index))
            else {
                continue;
            };
            port.mark_seen_at(*timestamp);
            ctx.add_input(*index, data.clone(), modified_inputs.contains(index));

            let Some(device) = state.devices.get(&slot.definition.device_slot) else {
                continue;
            };
            let keep = slot.retained.as_ref().is_some_and(|(held, retention)| {
                held.same_object(data) && retention.device() == device
            });
            if !keep {
                let retention = data.object().retain(device);
                slot.retained = Some((data.clone(), retention));
            }
        }

        for slot in state.outputs.values() {
            ctx.add_output_port(slot.definition.clone(), slot.data.clone());
        }
        for (slot, device) in &state.devices {
            ctx.add_device(*slot, device.clone());
        }

        state.modified = false;
        state.status = StageStatus::Executing;
        Ok(Some(ctx))
    }

    /// Run the body and install its outputs.
    fn run(&self, mut ctx: ExecutionContext) -> PipelineResult<()> {
        log::debug!("Executing stage {} for timestep {}", self, ctx.timestep());
        let started = Instant::now();

        let result = {
            let mut body = self.inner.body.lock();
            body.pre_execute(&mut ctx)
                .and_then(|()| body.execute(&mut ctx))
                .and_then(|()| body.post_execute(&mut ctx))
        };
        let result = result.and_then(|()| {
            if self.inner.runtime.is_enabled() {
                for device in ctx.assigned_devices() {
                    device.finish()?;
                }
                self.inner.runtime.record(EXECUTE_TIMING, started.elapsed());
            }
            Ok(())
        });

        let mut state = self.inner.state.lock();
        state.status = StageStatus::Done;
        match result {
            Ok(()) => {
                for (index, data) in ctx.take_outputs() {
                    if let Some(slot) = state.outputs.get_mut(&index) {
                        slot.data = Some(data);
                    }
                }
                state.executions += 1;
                for slot in state.inputs.values_mut() {
                    if slot.release_after_execute {
                        slot.retained = None;
                    }
                }
                Ok(())
            }
            Err(err) => {
                log::debug!("Stage {} failed: {}", self, err);
                Err(err)
            }
        }
    }
}

impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stage {}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.name, self.inner.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SimulatedDeviceConfig};
    use crate::core::types::{DataKind, ElementType};
    use crate::data::{DataObject, Image};
    use crate::device::{DeviceType, DefaultDevicePolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Copies input 0 (if any) to a new image, counting executions.
    struct Relay {
        name: String,
        runs: Arc<AtomicUsize>,
        fail: bool,
        optional: bool,
    }

    impl Relay {
        fn new(name: &str) -> (Self, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name: name.to_string(),
                    runs: runs.clone(),
                    fail: false,
                    optional: false,
                },
                runs,
            )
        }
    }

    impl ProcessObject for Relay {
        fn name(&self) -> &str {
            &self.name
        }

        fn ports(&self) -> StagePorts {
            let input = PortDefinition::input(0, DataKind::Image);
            let input = if self.optional { input.optional() } else { input };
            StagePorts::new()
                .input(input)
                .output(PortDefinition::output(0, DataKind::Image))
        }

        fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ctx.fail("requested failure"));
            }
            let output = ctx.output_image(0)?;
            match ctx.optional_input(0).and_then(Data::as_image) {
                Some(input) => output.create_from_image(input)?,
                None => output.create_2d(1, 1, ElementType::UInt8, 1)?,
            }
            Ok(())
        }
    }

    fn source_image() -> Image {
        let image = Image::new();
        image.create_2d(2, 2, ElementType::UInt8, 1).unwrap();
        image
    }

    #[test]
    fn test_new_stage_executes_once() {
        let context = PipelineContext::default();
        let (body, runs) = Relay::new("relay");
        let stage = Stage::new(body, &context);
        stage.set_input_data(0, source_image()).unwrap();

        assert_eq!(stage.status(), StageStatus::Idle);
        assert!(stage.is_modified());
        stage.update(1, StreamingMode::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(stage.status(), StageStatus::Done);
        assert!(!stage.is_modified());

        stage.update(1, StreamingMode::default()).unwrap();
        stage.update(2, StreamingMode::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(stage.execution_count(), 1);
    }

    #[test]
    fn test_missing_required_input() {
        let context = PipelineContext::default();
        let (body, runs) = Relay::new("relay");
        let stage = Stage::new(body, &context);

        let err = stage.update(1, StreamingMode::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingRequiredInput { port: 0, .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // Still modified, so wiring the input later executes it.
        assert!(stage.is_modified());
        assert_eq!(stage.unconnected_required_inputs(), vec![0]);
    }

    #[test]
    fn test_optional_input_may_be_absent() {
        let context = PipelineContext::default();
        let (mut body, runs) = Relay::new("relay");
        body.optional = true;
        let stage = Stage::new(body, &context);
        stage.update(1, StreamingMode::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(stage.output_data(0).is_ok());
    }

    #[test]
    fn test_failed_execution_is_not_retried() {
        let context = PipelineContext::default();
        let (mut body, runs) = Relay::new("relay");
        body.fail = true;
        let stage = Stage::new(body, &context);
        stage.set_input_data(0, source_image()).unwrap();

        let err = stage.update(1, StreamingMode::default()).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            stage.output_data(0),
            Err(PipelineError::NoOutputProduced { .. })
        ));
        stage.update(2, StreamingMode::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        stage.set_modified(true);
        assert!(stage.update(3, StreamingMode::default()).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_input_change_triggers_execution() {
        let context = PipelineContext::default();
        let (body, runs) = Relay::new("relay");
        let stage = Stage::new(body, &context);
        let image = Arc::new(source_image());
        stage.set_input_data(0, Arc::clone(&image)).unwrap();

        stage.update(1, StreamingMode::default()).unwrap();
        image.update_modified_timestamp();
        stage.update(2, StreamingMode::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        stage.update(3, StreamingMode::default()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let context = PipelineContext::default();
        let a = Stage::new(Relay::new("a").0, &context);
        let b = Stage::new(Relay::new("b").0, &context);
        a.set_input_connection(0, b.get_output_port(0).unwrap()).unwrap();
        b.set_input_connection(0, a.get_output_port(0).unwrap()).unwrap();

        match a.update(1, StreamingMode::default()) {
            Err(PipelineError::CycleDetected { stages }) => {
                assert_eq!(stages, vec![a.id(), b.id()]);
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_checks() {
        let context = PipelineContext::default();
        let stage = Stage::new(Relay::new("relay").0, &context);
        let other = Stage::new(Relay::new("other").0, &context);

        assert!(matches!(
            stage.set_input_connection(3, other.get_output_port(0).unwrap()),
            Err(PipelineError::PortNotFound {
                direction: PortDirection::Input,
                ..
            })
        ));
        assert!(matches!(
            other.get_output_port(5),
            Err(PipelineError::PortNotFound {
                direction: PortDirection::Output,
                ..
            })
        ));
        assert!(matches!(
            stage.set_input_data(0, crate::data::Mesh::new()),
            Err(PipelineError::TypeMismatch { .. })
        ));
        assert_eq!(stage.input_count(), 1);
        assert_eq!(stage.output_count(), 1);
    }

    #[test]
    fn test_device_slots_and_criteria() {
        let config = EngineConfig::new()
            .with_default_policy(DefaultDevicePolicy::FirstAccelerator)
            .with_simulated_device(SimulatedDeviceConfig::new("sim-0"));
        let context = PipelineContext::from_config(&config).unwrap();
        let stage = Stage::new(Relay::new("relay").0, &context);
        assert_eq!(stage.main_device().unwrap().name(), "sim-0");
        assert!(stage.device(4).is_err());

        stage
            .set_main_device_criteria(DeviceCriteria::new().with_type(DeviceType::Host))
            .unwrap();
        assert!(stage.main_device().unwrap().is_host());

        let accelerator = context.devices().devices()[1].clone();
        assert!(matches!(
            stage.set_main_device(accelerator),
            Err(PipelineError::CriteriaNotSatisfied { slot: 0, .. })
        ));
    }

    #[test]
    fn test_input_retained_on_slot_device() {
        let config = EngineConfig::new().with_simulated_device(SimulatedDeviceConfig::new("sim-0"));
        let context = PipelineContext::from_config(&config).unwrap();
        let accelerator = context.devices().devices()[1].clone();
        let stage = Stage::new(Relay::new("relay").0, &context);
        let image = Arc::new(source_image());
        stage.set_input_data(0, Arc::clone(&image)).unwrap();

        stage.update(1, StreamingMode::default()).unwrap();
        assert_eq!(image.reference_count(&ExecutionDevice::host()), 1);

        stage.set_main_device(accelerator.clone()).unwrap();
        assert_eq!(image.reference_count(&ExecutionDevice::host()), 0);
        assert_eq!(image.reference_count(&accelerator), 1);

        stage.release_input_after_execute(0, true).unwrap();
        stage.set_modified(true);
        stage.update(2, StreamingMode::default()).unwrap();
        assert_eq!(image.reference_count(&accelerator), 0);
    }

    #[test]
    fn test_runtime_measurement() {
        let context = PipelineContext::default();
        let stage = Stage::new(Relay::new("relay").0, &context);
        stage.set_input_data(0, source_image()).unwrap();
        assert!(stage.runtime().is_none());

        stage.enable_runtime_measurements();
        stage.update(1, StreamingMode::default()).unwrap();
        assert_eq!(stage.runtime().unwrap().samples, 1);
    }

    /// Records the timestamp of every input it consumes.
    struct Observer {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl ProcessObject for Observer {
        fn name(&self) -> &str {
            "observer"
        }

        fn ports(&self) -> StagePorts {
            StagePorts::new().input(PortDefinition::input(0, DataKind::Image))
        }

        fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
            let input = ctx.input(0)?;
            self.seen.lock().push(input.timestamp());
            Ok(())
        }
    }

    #[test]
    fn test_consumer_keeps_up_with_concurrent_producer() {
        let context = PipelineContext::default();
        let (mut body, _) = Relay::new("producer");
        body.optional = true;
        let producer = Stage::new(body, &context);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Stage::new(
            Observer {
                seen: Arc::clone(&seen),
            },
            &context,
        );
        consumer
            .set_input_connection(0, producer.get_output_port(0).unwrap())
            .unwrap();

        let driver = {
            let producer = producer.clone();
            std::thread::spawn(move || {
                for timestep in 0..200 {
                    producer.set_modified(true);
                    producer
                        .update(1_000 + timestep, StreamingMode::default())
                        .unwrap();
                }
            })
        };
        for timestep in 1..=200 {
            consumer.update(timestep, StreamingMode::default()).unwrap();
        }
        driver.join().unwrap();

        // With the producer idle, one more update must pick up whatever it
        // published last.
        consumer.update(5_000, StreamingMode::default()).unwrap();
        let latest = producer.output_data(0).unwrap().timestamp();
        assert_eq!(seen.lock().last().copied(), Some(latest));
        let port = consumer.input_connection(0).unwrap();
        assert_eq!(port.last_seen(), latest);
    }
}
