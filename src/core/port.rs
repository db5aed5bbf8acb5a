//! Port definitions for stage inputs/outputs.
//!
//! Ports define the interface of a stage - which data kinds it accepts and
//! produces. Ports are addressed by index; each input port is either
//! required or optional and names the device slot its data is consumed on.

use crate::core::error::PortDirection;
use crate::core::types::DataKind;
use serde::{Deserialize, Serialize};

/// Definition of a stage port (input or output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Port index within the stage
    pub index: usize,
    /// Kind of data this port accepts/produces
    pub kind: DataKind,
    /// Direction (input or output)
    pub direction: PortDirection,
    /// Whether the stage may execute without this input
    pub optional: bool,
    /// Device slot the data is consumed on (inputs only)
    pub device_slot: usize,
    /// Description for documentation
    pub description: String,
}

// ============================================================================
// PortDefinition Builder Pattern
// ============================================================================

impl PortDefinition {
    /// Create a new required input port definition.
    pub fn input(index: usize, kind: DataKind) -> Self {
        Self {
            index,
            kind,
            direction: PortDirection::Input,
            optional: false,
            device_slot: 0,
            description: String::new(),
        }
    }

    /// Create a new output port definition.
    pub fn output(index: usize, kind: DataKind) -> Self {
        Self {
            index,
            kind,
            direction: PortDirection::Output,
            optional: false,
            device_slot: 0,
            description: String::new(),
        }
    }

    /// Mark as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Consume this input on the given device slot.
    pub fn on_device_slot(mut self, slot: usize) -> Self {
        self.device_slot = slot;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether this input must be connected and produced before execution.
    pub fn is_required(&self) -> bool {
        self.direction == PortDirection::Input && !self.optional
    }
}

/// The full port interface of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePorts {
    /// Input port definitions
    pub inputs: Vec<PortDefinition>,
    /// Output port definitions
    pub outputs: Vec<PortDefinition>,
}

impl StagePorts {
    /// Create an empty port interface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input port.
    pub fn input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    /// Add an output port.
    pub fn output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    /// Find an input port by index.
    pub fn get_input(&self, index: usize) -> Option<&PortDefinition> {
        self.inputs.iter().find(|p| p.index == index)
    }

    /// Find an output port by index.
    pub fn get_output(&self, index: usize) -> Option<&PortDefinition> {
        self.outputs.iter().find(|p| p.index == index)
    }
}
