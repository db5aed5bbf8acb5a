//! A stage emitting one fixed data object.

use crate::core::error::PipelineResult;
use crate::core::port::{PortDefinition, StagePorts};
use crate::data::Data;
use crate::execution::ExecutionContext;
use crate::graph::ProcessObject;

/// Emits the same object on output 0 every time it executes.
///
/// Consumers re-execute only when the object's content changes, since the
/// port compares its modification timestamp.
#[derive(Debug, Clone)]
pub struct DataSource {
    data: Data,
}

impl DataSource {
    pub fn new(data: impl Into<Data>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &Data {
        &self.data
    }
}

impl ProcessObject for DataSource {
    fn name(&self) -> &str {
        "data_source"
    }

    fn ports(&self) -> StagePorts {
        StagePorts::new().output(
            PortDefinition::output(0, self.data.kind()).with_description("The wrapped object"),
        )
    }

    fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
        ctx.set_output(0, self.data.clone())
    }
}
