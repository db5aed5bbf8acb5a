//! Streaming modes and the streamer back-reference.
//!
//! The scheduler never interprets a [`StreamingMode`]; it forwards the value
//! to every stage body so that streaming sources can decide how to treat
//! frames that arrive faster than they are consumed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// How a streaming source hands frames to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamingMode {
    /// Every frame is processed, in order.
    #[default]
    ProcessAllFrames,
    /// Frames that were not consumed in time are dropped.
    NewestFrameOnly,
    /// Every frame is kept after it has been processed.
    StoreAllFrames,
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamingMode::ProcessAllFrames => "process-all-frames",
            StreamingMode::NewestFrameOnly => "newest-frame-only",
            StreamingMode::StoreAllFrames => "store-all-frames",
        };
        f.write_str(name)
    }
}

impl FromStr for StreamingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process-all-frames" => Ok(StreamingMode::ProcessAllFrames),
            "newest-frame-only" => Ok(StreamingMode::NewestFrameOnly),
            "store-all-frames" => Ok(StreamingMode::StoreAllFrames),
            other => Err(format!("unknown streaming mode '{}'", other)),
        }
    }
}

/// The producer of a dynamic sequence of data objects.
///
/// Frames hold only a weak reference to their streamer.
pub trait Streamer: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Number of frames emitted so far.
    fn frames_produced(&self) -> u64;

    /// Whether the stream has no more frames to offer.
    fn has_reached_end(&self) -> bool {
        false
    }
}

/// Frame bookkeeping shared between a streaming stage and its frames.
#[derive(Debug)]
pub struct StreamState {
    name: String,
    frames: AtomicU64,
    limit: Option<u64>,
    ended: AtomicBool,
}

impl StreamState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frames: AtomicU64::new(0),
            limit: None,
            ended: AtomicBool::new(false),
        }
    }

    /// End the stream after `limit` frames.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Count one more frame and return its index.
    pub fn next_frame(&self) -> u64 {
        let index = self.frames.fetch_add(1, Ordering::AcqRel);
        if self.limit.is_some_and(|limit| index + 1 >= limit) {
            self.ended.store(true, Ordering::Release);
        }
        index
    }

    /// End the stream now.
    pub fn end(&self) {
        self.ended.store(true, Ordering::Release);
    }
}

impl Streamer for StreamState {
    fn name(&self) -> &str {
        &self.name
    }

    fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    fn has_reached_end(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}
