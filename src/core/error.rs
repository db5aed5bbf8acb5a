//! Error types for heteroflow.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Name the stage, port or device involved
//! - Be surfaced synchronously to the caller that detected them
//! - Convert upward into [`HeteroflowError`] with `?`

use crate::core::types::{DataKind, ElementType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub Uuid);

impl StageId {
    /// Create a new random stage ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a stage ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataId(pub Uuid);

impl DataId {
    /// Create a new random data ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DataId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Top-level error type for heteroflow.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum HeteroflowError {
    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by access guards and the coherence store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Data object has not been initialized")]
    NotInitialized,

    #[error("Requesting access to a data object that is already being written to")]
    AlreadyWriting,

    #[error("Write access requested while the data object is being accessed")]
    ConcurrentAccess,

    #[error("No representation of the data object is marked as current")]
    NoCurrentData,

    #[error("Invalid dimensions: {reason}")]
    InvalidDimensions { reason: String },

    #[error("Element type mismatch: data holds {stored}, view requested {requested}")]
    ElementTypeMismatch {
        stored: ElementType,
        requested: ElementType,
    },

    #[error("Mutable view requested through a read-only access guard")]
    ReadOnlyAccess,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Errors raised by device backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Surface {0} not found on device")]
    SurfaceNotFound(u64),

    #[error("Failed to allocate {bytes} bytes on {device}")]
    AllocationFailed { device: String, bytes: usize },

    #[error("Size mismatch: surface holds {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("Command queue of {0} is disconnected")]
    QueueDisconnected(String),

    #[error("Transfer failed on {device}: {reason}")]
    TransferFailed { device: String, reason: String },

    #[error("Device not available: {0}")]
    NotAvailable(String),
}

/// Direction of a stage port, used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "input"),
            PortDirection::Output => write!(f, "output"),
        }
    }
}

/// Errors raised by the pipeline graph and scheduler.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Missing required input {port} on stage {stage}")]
    MissingRequiredInput { stage: StageId, port: usize },

    #[error("Stage {stage} has not produced output {port} yet")]
    NoOutputProduced { stage: StageId, port: usize },

    #[error("Stage {stage} has no {direction} port {port}")]
    PortNotFound {
        stage: StageId,
        port: usize,
        direction: PortDirection,
    },

    #[error("Cannot connect {got} to a port expecting {expected}")]
    TypeMismatch { expected: DataKind, got: DataKind },

    #[error("Cycle detected in pipeline involving stages: {stages:?}")]
    CycleDetected { stages: Vec<StageId> },

    #[error("Device {device} does not satisfy the criteria of slot {slot} on stage {stage}")]
    CriteriaNotSatisfied {
        stage: StageId,
        slot: usize,
        device: String,
    },

    #[error("No device matches the requested criteria")]
    NoMatchingDevice,

    #[error("Stage {stage} has no device assigned to slot {slot}")]
    DeviceSlotNotFound { stage: StageId, slot: usize },

    #[error("No stage named '{0}' in the pipeline")]
    StageNotFound(String),

    #[error("Stage {stage} execution failed: {message}")]
    StageExecution { stage: StageId, message: String },

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Error Utilities
// ============================================================================

impl PipelineError {
    /// Get the stage that caused this error, if applicable.
    pub fn stage_id(&self) -> Option<StageId> {
        match self {
            PipelineError::MissingRequiredInput { stage, .. }
            | PipelineError::NoOutputProduced { stage, .. }
            | PipelineError::PortNotFound { stage, .. }
            | PipelineError::CriteriaNotSatisfied { stage, .. }
            | PipelineError::DeviceSlotNotFound { stage, .. }
            | PipelineError::StageExecution { stage, .. } => Some(*stage),
            PipelineError::CycleDetected { stages } => stages.first().copied(),
            _ => None,
        }
    }

    /// Whether a driver loop may report this error and continue with the
    /// next timestep.
    ///
    /// Structural defects (cycles, missing wiring) repeat on every timestep,
    /// so they are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PipelineError::CycleDetected { .. }
                | PipelineError::PortNotFound { .. }
                | PipelineError::TypeMismatch { .. }
                | PipelineError::DeviceSlotNotFound { .. }
                | PipelineError::StageNotFound(_)
        )
    }

    /// Wrap an arbitrary failure from a stage body.
    pub fn execution(stage: StageId, message: impl Into<String>) -> Self {
        PipelineError::StageExecution {
            stage,
            message: message.into(),
        }
    }
}

impl AccessError {
    /// Shorthand for an [`AccessError::InvalidDimensions`].
    pub fn invalid_dimensions(reason: impl Into<String>) -> Self {
        AccessError::InvalidDimensions {
            reason: reason.into(),
        }
    }
}

/// Result type alias for heteroflow operations.
pub type HeteroflowResult<T> = Result<T, HeteroflowError>;

/// Result type alias for access operations.
pub type AccessResult<T> = Result<T, AccessError>;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type alias for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_display() {
        let id = StageId::new();
        let display = format!("{}", id);
        assert_eq!(display.len(), 8);
    }

    #[test]
    fn test_pipeline_error_stage_id() {
        let stage = StageId::new();
        let error = PipelineError::MissingRequiredInput { stage, port: 0 };
        assert_eq!(error.stage_id(), Some(stage));

        let error = PipelineError::NoMatchingDevice;
        assert_eq!(error.stage_id(), None);
    }

    #[test]
    fn test_recoverability() {
        let stage = StageId::new();
        assert!(PipelineError::execution(stage, "boom").is_recoverable());
        assert!(PipelineError::from(AccessError::ConcurrentAccess).is_recoverable());
        assert!(!PipelineError::CycleDetected { stages: vec![stage] }.is_recoverable());
    }

    #[test]
    fn test_access_error_converts_upward() {
        fn fails() -> HeteroflowResult<()> {
            let inner: AccessResult<()> = Err(AccessError::NoCurrentData);
            inner?;
            Ok(())
        }
        assert!(matches!(
            fails(),
            Err(HeteroflowError::Access(AccessError::NoCurrentData))
        ));
    }
}
