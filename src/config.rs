//! Engine configuration.
//!
//! Loaded from TOML. Every section is optional; missing keys take the
//! defaults below.
//!
//! ```toml
//! [runtime]
//! measure = true
//!
//! [devices]
//! default_policy = "prefer-gpu"
//! probe_gpu = false
//!
//! [[devices.simulated]]
//! name = "sim-gpu-0"
//! kind = "gpu"
//! peer_group = 1
//!
//! [driver]
//! streaming_mode = "newest-frame-only"
//! max_timesteps = 100
//! interval_ms = 10
//!
//! [logging]
//! level = "debug"
//! ```

use crate::core::error::ConfigError;
use crate::device::{DefaultDevicePolicy, DeviceCapabilities, DeviceKind};
use crate::execution::StreamingMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Runtime measurement settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Measure every stage created from a context built with this config.
    pub measure: bool,
}

/// One in-process simulated accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDeviceConfig {
    pub name: String,
    #[serde(default = "default_device_kind")]
    pub kind: DeviceKind,
    /// Native support for three-channel surfaces.
    #[serde(default)]
    pub three_channel_surfaces: bool,
    /// Devices sharing a peer group copy directly between each other.
    #[serde(default)]
    pub peer_group: Option<u32>,
}

fn default_device_kind() -> DeviceKind {
    DeviceKind::Gpu
}

impl SimulatedDeviceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::Gpu,
            three_channel_surfaces: false,
            peer_group: None,
        }
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_peer_group(mut self, group: u32) -> Self {
        self.peer_group = Some(group);
        self
    }

    pub fn with_three_channel_surfaces(mut self) -> Self {
        self.three_channel_surfaces = true;
        self
    }

    /// Capabilities the simulated backend is created with.
    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::new(self.kind);
        if self.three_channel_surfaces {
            caps = caps.with_three_channel_surfaces();
        }
        if let Some(group) = self.peer_group {
            caps = caps.with_peer_group(group);
        }
        caps
    }
}

/// Device registry settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub default_policy: DefaultDevicePolicy,
    /// Try to open a real wgpu adapter.
    pub probe_gpu: bool,
    pub simulated: Vec<SimulatedDeviceConfig>,
}

/// Settings for the computation thread driving a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub streaming_mode: StreamingMode,
    /// Stop after this many timesteps. Runs until stopped when absent.
    pub max_timesteps: Option<u64>,
    /// Pause between two timesteps.
    pub interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            streaming_mode: StreamingMode::default(),
            max_timesteps: None,
            interval_ms: 0,
        }
    }
}

impl DriverConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Logging settings, consumed by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub devices: DevicesConfig,
    pub driver: DriverConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Create a configuration with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for device in &self.devices.simulated {
            if device.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "simulated device name must not be empty".to_string(),
                ));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate simulated device '{}'",
                    device.name
                )));
            }
        }
        if self.driver.max_timesteps == Some(0) {
            return Err(ConfigError::Invalid(
                "driver.max_timesteps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_runtime_measurement(mut self, measure: bool) -> Self {
        self.runtime.measure = measure;
        self
    }

    pub fn with_default_policy(mut self, policy: DefaultDevicePolicy) -> Self {
        self.devices.default_policy = policy;
        self
    }

    pub fn with_simulated_device(mut self, device: SimulatedDeviceConfig) -> Self {
        self.devices.simulated.push(device);
        self
    }

    pub fn with_gpu_probe(mut self, probe: bool) -> Self {
        self.devices.probe_gpu = probe;
        self
    }

    pub fn with_streaming_mode(mut self, mode: StreamingMode) -> Self {
        self.driver.streaming_mode = mode;
        self
    }

    pub fn with_max_timesteps(mut self, max: u64) -> Self {
        self.driver.max_timesteps = Some(max);
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.driver.interval_ms = interval_ms;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(!config.runtime.measure);
        assert_eq!(config.devices.default_policy, DefaultDevicePolicy::Host);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_full_document() {
        let text = r#"
            [runtime]
            measure = true

            [devices]
            default_policy = "prefer-gpu"

            [[devices.simulated]]
            name = "sim-0"
            peer_group = 1

            [[devices.simulated]]
            name = "sim-1"
            kind = "cpu"
            three_channel_surfaces = true

            [driver]
            streaming_mode = "newest-frame-only"
            max_timesteps = 5
            interval_ms = 2
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert!(config.runtime.measure);
        assert_eq!(config.devices.default_policy, DefaultDevicePolicy::PreferGpu);
        assert_eq!(config.devices.simulated.len(), 2);
        assert_eq!(config.devices.simulated[0].kind, DeviceKind::Gpu);
        assert_eq!(config.devices.simulated[0].capabilities().peer_group, Some(1));
        assert!(config.devices.simulated[1].capabilities().supports_channels(3));
        assert_eq!(config.driver.streaming_mode, StreamingMode::NewestFrameOnly);
        assert_eq!(config.driver.interval(), Duration::from_millis(2));
    }

    #[test]
    fn test_validation() {
        let duplicate = EngineConfig::new()
            .with_simulated_device(SimulatedDeviceConfig::new("a"))
            .with_simulated_device(SimulatedDeviceConfig::new("a"));
        assert!(matches!(duplicate.validate(), Err(ConfigError::Invalid(_))));

        let empty = EngineConfig::new().with_simulated_device(SimulatedDeviceConfig::new(" "));
        assert!(empty.validate().is_err());

        assert!(EngineConfig::new().with_max_timesteps(0).validate().is_err());
        assert!(matches!(
            EngineConfig::from_toml_str("[driver]\nmax_timesteps = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nmeasure = true").unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.runtime.measure);

        let missing = EngineConfig::from_file("/nonexistent/heteroflow.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
