//! Named collections of stages.

use crate::core::error::{PipelineError, PipelineResult};
use crate::execution::context::PipelineContext;
use crate::execution::runtime::RuntimeMeasurement;
use crate::execution::streaming::StreamingMode;
use crate::graph::stage::{ProcessObject, Stage};
use crate::graph::topology::TopologyAnalyzer;
use indexmap::IndexMap;

/// A pipeline: named stages sharing one [`PipelineContext`].
///
/// The pipeline owns no scheduling logic of its own; `update` pulls each sink
/// and the stages do the rest.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    context: PipelineContext,
    stages: IndexMap<String, Stage>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, context: PipelineContext) -> Self {
        Self {
            name: name.into(),
            context,
            stages: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Create a stage for `body` under `name` and return its handle.
    ///
    /// A stage already registered under `name` is replaced.
    pub fn add_stage(&mut self, name: impl Into<String>, body: impl ProcessObject) -> Stage {
        let stage = Stage::new(body, &self.context);
        self.insert(name, stage.clone());
        stage
    }

    /// Register an existing stage. Returns the stage it replaces, if any.
    pub fn insert(&mut self, name: impl Into<String>, stage: Stage) -> Option<Stage> {
        let name = name.into();
        log::debug!("Pipeline {}: adding stage '{}' {}", self.name, name, stage);
        self.stages.insert(name, stage)
    }

    pub fn remove(&mut self, name: &str) -> Option<Stage> {
        self.stages.shift_remove(name)
    }

    pub fn stage(&self, name: &str) -> PipelineResult<&Stage> {
        self.stages
            .get(name)
            .ok_or_else(|| PipelineError::StageNotFound(name.to_string()))
    }

    /// Registered stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &Stage)> {
        self.stages.iter().map(|(name, stage)| (name.as_str(), stage))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Connect output `output` of `producer` to input `input` of `consumer`.
    pub fn connect(
        &self,
        producer: &str,
        output: usize,
        consumer: &str,
        input: usize,
    ) -> PipelineResult<()> {
        let port = self.stage(producer)?.get_output_port(output)?;
        self.stage(consumer)?.set_input_connection(input, port)
    }

    /// Registered stages no other registered stage consumes.
    pub fn sinks(&self) -> Vec<Stage> {
        TopologyAnalyzer::new(self.stages.values().cloned()).sinks()
    }

    /// Every stage the sinks depend on, producers first.
    pub fn execution_order(&self) -> PipelineResult<Vec<Stage>> {
        TopologyAnalyzer::from_roots(self.stages.values()).topological_sort()
    }

    /// Check for cycles and unconnected required inputs.
    pub fn validate(&self) -> PipelineResult<()> {
        for stage in self.execution_order()? {
            if let Some(&port) = stage.unconnected_required_inputs().first() {
                return Err(PipelineError::MissingRequiredInput {
                    stage: stage.id(),
                    port,
                });
            }
        }
        Ok(())
    }

    /// Update every sink for `timestep`.
    ///
    /// All sinks are pulled even if one fails; the first error is returned.
    pub fn update(&self, timestep: u64, mode: StreamingMode) -> PipelineResult<()> {
        let mut first_error = None;
        for sink in self.sinks() {
            if let Err(err) = sink.update(timestep, mode) {
                log::debug!("Pipeline {}: sink {} failed: {}", self.name, sink, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Execution timings of every measured stage, by stage name.
    pub fn runtime_report(&self) -> Vec<(String, RuntimeMeasurement)> {
        self.stages
            .iter()
            .filter_map(|(name, stage)| stage.runtime().map(|m| (name.clone(), m)))
            .collect()
    }
}
