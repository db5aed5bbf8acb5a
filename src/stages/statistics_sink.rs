//! A sink publishing intensity statistics of its input.

use crate::core::error::PipelineResult;
use crate::core::port::{PortDefinition, StagePorts};
use crate::core::types::{DataKind, IntensityStats};
use crate::data::DataObject;
use crate::execution::ExecutionContext;
use crate::graph::ProcessObject;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Statistics of one consumed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub timestep: u64,
    /// Modification timestamp of the measured image.
    pub data_timestamp: u64,
    pub stats: IntensityStats,
}

#[derive(Debug, Default)]
struct Published {
    latest: Option<FrameStatistics>,
    frames: u64,
}

/// Shared handle to what a [`StatisticsSink`] has published.
#[derive(Debug, Clone, Default)]
pub struct StatisticsHandle {
    inner: Arc<Mutex<Published>>,
}

impl StatisticsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent statistics.
    pub fn latest(&self) -> Option<FrameStatistics> {
        self.inner.lock().latest
    }

    /// Number of frames measured.
    pub fn frames(&self) -> u64 {
        self.inner.lock().frames
    }

    fn publish(&self, statistics: FrameStatistics) {
        let mut published = self.inner.lock();
        published.latest = Some(statistics);
        published.frames += 1;
    }
}

/// Computes min, max and mean of input 0 each time it changes.
#[derive(Debug, Clone, Default)]
pub struct StatisticsSink {
    handle: StatisticsHandle,
}

impl StatisticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to read published statistics from.
    pub fn handle(&self) -> StatisticsHandle {
        self.handle.clone()
    }
}

impl ProcessObject for StatisticsSink {
    fn name(&self) -> &str {
        "statistics_sink"
    }

    fn ports(&self) -> StagePorts {
        StagePorts::new().input(PortDefinition::input(0, DataKind::Image))
    }

    fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
        let image = ctx.input_image(0)?;
        let stats = image.intensity_statistics()?;
        let statistics = FrameStatistics {
            timestep: ctx.timestep(),
            data_timestamp: image.timestamp(),
            stats,
        };
        log::debug!(
            "Timestep {}: min {} max {} mean {:.3}",
            statistics.timestep,
            stats.minimum,
            stats.maximum,
            stats.mean
        );
        self.handle.publish(statistics);
        Ok(())
    }
}
