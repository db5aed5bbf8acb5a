//! Ports: producer-to-consumer edges of the pipeline graph.

use crate::core::error::{PipelineResult, StageId};
use crate::data::Data;
use crate::graph::stage::Stage;
use std::fmt;

/// One edge from a producer's output slot to a consumer's input.
///
/// A port holds no data. It resolves to whatever the producer's output slot
/// holds and caches the timestamp it last saw there.
#[derive(Clone)]
pub struct Port {
    producer: Stage,
    output: usize,
    last_seen: u64,
}

impl Port {
    /// Create a port on output `output` of `producer` that has seen nothing.
    pub fn new(producer: Stage, output: usize) -> Self {
        Self {
            producer,
            output,
            last_seen: 0,
        }
    }

    pub fn producer(&self) -> &Stage {
        &self.producer
    }

    pub fn producer_id(&self) -> StageId {
        self.producer.id()
    }

    pub fn output_index(&self) -> usize {
        self.output
    }

    /// Timestamp cached by the last [`Port::mark_seen`].
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// The producer's current output. Fails with `NoOutputProduced` until the
    /// producer has executed.
    pub fn get_data(&self) -> PipelineResult<Data> {
        self.producer.output_data(self.output)
    }

    /// Whether the producer's output changed since the last `mark_seen`.
    ///
    /// Timestamps are process-wide and never reused, so any difference means
    /// a different object or new content. A port whose producer has nothing
    /// yet is not modified.
    pub fn is_modified(&self) -> bool {
        self.get_data()
            .map(|data| data.timestamp() != self.last_seen)
            .unwrap_or(false)
    }

    /// Cache the timestamp of the producer's current output.
    pub fn mark_seen(&mut self) {
        if let Ok(data) = self.get_data() {
            self.last_seen = data.timestamp();
        }
    }

    /// Cache `timestamp`, the timestamp of the data actually consumed.
    pub fn mark_seen_at(&mut self, timestamp: u64) {
        self.last_seen = timestamp;
    }

    /// Forget what was seen, so the next check reports a change.
    pub(crate) fn reset(&mut self) {
        self.last_seen = 0;
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.producer.id() == other.producer.id() && self.output == other.output
    }
}

impl Eq for Port {}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("producer", &self.producer.id())
            .field("output", &self.output)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer.name(), self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PipelineError;
    use crate::data::Image;
    use crate::execution::PipelineContext;
    use crate::stages::DataSource;

    #[test]
    fn test_port_tracks_timestamps() {
        let context = PipelineContext::default();
        let image = Image::new();
        image.create_2d(2, 2, crate::core::types::ElementType::UInt8, 1).unwrap();
        let source = Stage::new(DataSource::new(image), &context);

        let mut port = source.get_output_port(0).unwrap();
        assert!(matches!(
            port.get_data(),
            Err(PipelineError::NoOutputProduced { .. })
        ));
        assert!(!port.is_modified());

        source.update(1, Default::default()).unwrap();
        assert!(port.is_modified());
        port.mark_seen();
        assert!(!port.is_modified());

        port.get_data().unwrap().object().update_modified_timestamp();
        assert!(port.is_modified());
    }

    #[test]
    fn test_port_equality() {
        let context = PipelineContext::default();
        let source = Stage::new(DataSource::new(Image::new()), &context);
        let a = source.get_output_port(0).unwrap();
        let mut b = source.get_output_port(0).unwrap();
        b.last_seen = 42;
        assert_eq!(a, b);
    }
}
