//! A streaming source of deterministic gradient images.

use crate::core::error::PipelineResult;
use crate::core::port::{PortDefinition, StagePorts};
use crate::core::types::{DataKind, ElementType};
use crate::data::DataObject;
use crate::execution::streaming::{StreamState, Streamer};
use crate::execution::ExecutionContext;
use crate::graph::ProcessObject;
use rayon::prelude::*;
use std::sync::Arc;

/// Emits one 8-bit gradient image per timestep, created on the main device.
///
/// Pixel `(x, y)` of frame `n` holds `(x + y + n) % 256` in every component.
/// Once the frame limit is reached the last frame stays on the output.
#[derive(Debug, Clone)]
pub struct PatternSource {
    width: u32,
    height: u32,
    components: u32,
    state: Arc<StreamState>,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            components: 1,
            state: Arc::new(StreamState::new("pattern")),
        }
    }

    pub fn with_components(mut self, components: u32) -> Self {
        self.components = components;
        self
    }

    /// End the stream after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.state = Arc::new(StreamState::new("pattern").with_limit(frames));
        self
    }

    /// Shared frame bookkeeping, also linked from every emitted frame.
    pub fn stream(&self) -> Arc<StreamState> {
        Arc::clone(&self.state)
    }

    /// Bytes of frame `frame`.
    pub fn frame_bytes(&self, frame: u64) -> Vec<u8> {
        let (width, components) = (self.width as usize, self.components as usize);
        let mut bytes = vec![0u8; width * self.height as usize * components];
        if bytes.is_empty() {
            return bytes;
        }
        bytes
            .par_chunks_mut(width * components)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, pixel) in row.chunks_exact_mut(components).enumerate() {
                    let value = ((x as u64 + y as u64 + frame) % 256) as u8;
                    pixel.fill(value);
                }
            });
        bytes
    }
}

impl ProcessObject for PatternSource {
    fn name(&self) -> &str {
        "pattern_source"
    }

    fn ports(&self) -> StagePorts {
        StagePorts::new()
            .output(PortDefinition::output(0, DataKind::Image).with_description("Gradient frame"))
    }

    fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
        if self.state.has_reached_end() {
            log::trace!("Pattern stream ended, keeping the last frame");
            return Ok(());
        }

        let frame = self.state.next_frame();
        let device = ctx.main_device()?.clone();
        let image = ctx.output_image(0)?;
        image.create_2d_with_data(
            self.width,
            self.height,
            ElementType::UInt8,
            self.components,
            &device,
            &self.frame_bytes(frame),
        )?;
        let streamer: Arc<dyn Streamer> = self.state.clone();
        image.set_streamer(&streamer);
        log::trace!(
            "Pattern frame {} on {} ({})",
            frame,
            device,
            ctx.streaming_mode()
        );
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        true
    }
}
