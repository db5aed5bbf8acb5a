//! Built-in stages.
//!
//! - [`DataSource`]: emits a fixed data object
//! - [`PatternSource`]: streaming gradient images
//! - [`ImageKernel`]: runs a byte kernel on the main device
//! - [`StatisticsSink`]: publishes intensity statistics

pub mod data_source;
pub mod image_kernel;
pub mod pattern_source;
pub mod statistics_sink;

pub use data_source::DataSource;
pub use image_kernel::{ImageKernel, PixelKernel};
pub use pattern_source::PatternSource;
pub use statistics_sink::{FrameStatistics, StatisticsHandle, StatisticsSink};
