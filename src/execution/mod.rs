//! Execution module.
//!
//! This module holds what runs around a stage body: the contexts it sees,
//! runtime measurement, streaming modes and the driver thread.

pub mod context;
pub mod driver;
pub mod runtime;
pub mod streaming;

pub use context::{ExecutionContext, PipelineContext};
pub use driver::{DriverEvent, PipelineDriver};
pub use runtime::{RuntimeManager, RuntimeMeasurement};
pub use streaming::{StreamState, Streamer, StreamingMode};
