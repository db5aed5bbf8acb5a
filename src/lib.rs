//! # Heteroflow - Dataflow pipelines across host and accelerators
//!
//! Heteroflow runs typed data objects (images, meshes, point sets) through a
//! graph of processing stages that may execute on the host or on accelerator
//! devices with their own memory spaces.
//!
//! ## Features
//!
//! - **Data coherence**: every object tracks which device holds a current copy
//!   and transfers lazily, only when a stage asks for it somewhere else
//! - **Access guards**: scoped read or exclusive read-write access, released
//!   on every exit path
//! - **Lazy re-execution**: stages run only when marked modified or when an
//!   input's modification timestamp changed
//! - **Explicit context**: devices and configuration travel in a
//!   [`PipelineContext`](execution::PipelineContext), not in globals
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use heteroflow::prelude::*;
//!
//! let context = PipelineContext::from_config(&EngineConfig::default())?;
//! let mut pipeline = Pipeline::new("demo", context);
//!
//! pipeline.add_stage("source", PatternSource::new(64, 64));
//! pipeline.add_stage("invert", ImageKernel::invert());
//! let sink = StatisticsSink::new();
//! let stats = sink.handle();
//! pipeline.add_stage("stats", sink);
//!
//! pipeline.connect("source", 0, "invert", 0)?;
//! pipeline.connect("invert", 0, "stats", 0)?;
//!
//! pipeline.update(1, StreamingMode::default())?;
//! println!("{:?}", stats.latest());
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: element types, port definitions and error handling
//! - [`device`]: execution devices, backends and the device registry
//! - [`data`]: data objects, the coherence store and access guards
//! - [`graph`]: stages, ports, topology and pipelines
//! - [`execution`]: contexts, runtime measurement, streaming and the driver
//! - [`stages`]: built-in stages
//! - [`config`]: engine configuration
//!
//! ## Writing a Stage
//!
//! Implement [`ProcessObject`](graph::ProcessObject):
//!
//! ```rust,ignore
//! use heteroflow::prelude::*;
//!
//! struct Threshold(u8);
//!
//! impl ProcessObject for Threshold {
//!     fn name(&self) -> &str {
//!         "threshold"
//!     }
//!
//!     fn ports(&self) -> StagePorts {
//!         StagePorts::new()
//!             .input(PortDefinition::input(0, DataKind::Image))
//!             .output(PortDefinition::output(0, DataKind::Image))
//!     }
//!
//!     fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
//!         let input = ctx.input_image(0)?;
//!         let output = input.copy(&ExecutionDevice::host())?;
//!         {
//!             let access = output.image_access(AccessMode::ReadWrite)?;
//!             for value in access.as_mut_slice::<u8>()?.iter_mut() {
//!                 *value = if *value >= self.0 { 255 } else { 0 };
//!             }
//!         }
//!         ctx.set_output(0, output)
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod data;
pub mod device;
pub mod execution;
pub mod graph;
pub mod stages;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use heteroflow::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{AccessMode, DataKind, Element, ElementType, IntensityStats};

    // Port definitions
    pub use crate::core::port::{PortDefinition, StagePorts};

    // Errors
    pub use crate::core::error::{
        AccessError, AccessResult, ConfigError, DataId, DeviceError, HeteroflowError,
        HeteroflowResult, PipelineError, PipelineResult, StageId,
    };

    // Devices
    pub use crate::device::{
        DefaultDevicePolicy, DeviceBackend, DeviceCapabilities, DeviceCriteria, DeviceKind,
        DeviceRegistry, DeviceType, ExecutionDevice, GpuDevice, SimulatedDevice,
    };

    // Data
    pub use crate::data::{
        CoherenceState, Data, DataObject, DeviceAccess, HostAccess, Image, ImageMetadata, Mesh,
        MeshVertex, PointSet, Retention,
    };

    // Graph
    pub use crate::graph::{Pipeline, Port, ProcessObject, Stage, StageStatus, TopologyAnalyzer};

    // Execution
    pub use crate::execution::{
        DriverEvent, ExecutionContext, PipelineContext, PipelineDriver, RuntimeMeasurement,
        StreamingMode, Streamer,
    };

    // Built-in stages
    pub use crate::stages::{DataSource, ImageKernel, PatternSource, StatisticsSink};

    // Configuration
    pub use crate::config::EngineConfig;
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
        assert_eq!(super::NAME, "heteroflow");
    }

    #[test]
    fn test_basic_pipeline() {
        let mut pipeline = Pipeline::new("basic", PipelineContext::default());
        pipeline.add_stage("source", PatternSource::new(4, 4));
        pipeline.add_stage("invert", ImageKernel::invert());
        let sink = StatisticsSink::new();
        let stats = sink.handle();
        pipeline.add_stage("stats", sink);

        assert!(pipeline.connect("source", 0, "invert", 0).is_ok());
        assert!(pipeline.connect("invert", 0, "stats", 0).is_ok());
        assert_eq!(pipeline.len(), 3);

        pipeline.update(1, StreamingMode::default()).unwrap();
        let latest = stats.latest().unwrap();
        // Frame 0 spans 0..=6, inverted to 249..=255.
        assert_eq!(latest.stats.maximum, 255.0);
        assert_eq!(latest.stats.minimum, 249.0);
    }
}
