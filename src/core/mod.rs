//! Core types shared by every layer of heteroflow.
//!
//! This module contains:
//! - Element and data kinds
//! - Port definitions
//! - Error types

pub mod error;
pub mod port;
pub mod types;

// Re-export commonly used types
pub use error::{AccessError, DeviceError, HeteroflowError, PipelineError, StageId};
pub use port::{PortDefinition, StagePorts};
pub use types::{AccessMode, DataKind, Element, ElementSlice, ElementType, IntensityStats};
