//! Runtime measurement for stage executions.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Accumulated timing samples for one named activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMeasurement {
    pub name: String,
    pub samples: u64,
    pub sum_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl RuntimeMeasurement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            samples: 0,
            sum_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
        }
    }

    /// Add one sample.
    pub fn add_sample(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.samples += 1;
        self.sum_ms += ms;
        self.min_ms = self.min_ms.min(ms);
        self.max_ms = self.max_ms.max(ms);
    }

    /// Mean over all samples, zero when empty.
    pub fn average_ms(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum_ms / self.samples as f64
        }
    }
}

impl fmt::Display for RuntimeMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.samples == 0 {
            return write!(f, "{}: no samples", self.name);
        }
        write!(
            f,
            "{}: {} samples, avg {:.3} ms (min {:.3}, max {:.3})",
            self.name,
            self.samples,
            self.average_ms(),
            self.min_ms,
            self.max_ms
        )
    }
}

/// Named timings collected while measurement is enabled.
#[derive(Debug, Default)]
pub struct RuntimeManager {
    enabled: AtomicBool,
    timings: Mutex<BTreeMap<String, RuntimeMeasurement>>,
}

impl RuntimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Record a sample under `name`. Ignored while disabled.
    pub fn record(&self, name: &str, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        self.timings
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| RuntimeMeasurement::new(name))
            .add_sample(elapsed);
    }

    pub fn timing(&self, name: &str) -> Option<RuntimeMeasurement> {
        self.timings.lock().get(name).cloned()
    }

    /// Every timing, ordered by name.
    pub fn timings(&self) -> Vec<RuntimeMeasurement> {
        self.timings.lock().values().cloned().collect()
    }

    pub fn reset(&self) {
        self.timings.lock().clear();
    }
}
