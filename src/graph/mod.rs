//! Graph module: stages, ports and the update scheduler.
//!
//! A pipeline is a directed acyclic graph where stages are nodes and
//! [`Port`]s are the edges carrying data from a producer's output slot to a
//! consumer's input. Execution is pull-based: updating a stage updates its
//! producers first.

pub mod connection;
pub mod pipeline;
pub mod stage;
pub mod topology;

// Re-export commonly used types
pub use connection::Port;
pub use pipeline::Pipeline;
pub use stage::{ProcessObject, Stage, StageStatus, EXECUTE_TIMING};
pub use topology::{upstream_closure, TopologyAnalyzer};
