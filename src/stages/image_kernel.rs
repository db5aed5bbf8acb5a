//! Run a byte kernel over an image on the stage's main device.

use crate::core::error::PipelineResult;
use crate::core::port::{PortDefinition, StagePorts};
use crate::core::types::{AccessMode, DataKind};
use crate::execution::ExecutionContext;
use crate::graph::ProcessObject;
use std::fmt;
use std::sync::Arc;

/// A kernel over the raw bytes of an image.
///
/// On accelerators the bytes are in the device layout, so three-channel
/// images may arrive padded to four channels.
pub type PixelKernel = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Copies input 0 onto the main device and runs a kernel on the copy with
/// READ_WRITE access. The input is never modified.
#[derive(Clone)]
pub struct ImageKernel {
    name: String,
    kernel: PixelKernel,
}

impl ImageKernel {
    pub fn new(name: impl Into<String>, kernel: impl Fn(&mut [u8]) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            kernel: Arc::new(kernel),
        }
    }

    /// Invert every byte.
    pub fn invert() -> Self {
        Self::new("invert", |bytes: &mut [u8]| {
            for byte in bytes.iter_mut() {
                *byte = !*byte;
            }
        })
    }
}

impl fmt::Debug for ImageKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageKernel")
            .field("name", &self.name)
            .finish()
    }
}

impl ProcessObject for ImageKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> StagePorts {
        StagePorts::new()
            .input(PortDefinition::input(0, DataKind::Image).with_description("Source image"))
            .output(PortDefinition::output(0, DataKind::Image).with_description("Processed copy"))
    }

    fn execute(&mut self, ctx: &mut ExecutionContext) -> PipelineResult<()> {
        let input = ctx.input_image(0)?;
        let device = ctx.main_device()?.clone();
        let output = input.copy(&device)?;

        if device.is_host() {
            let access = output.image_access(AccessMode::ReadWrite)?;
            let mut bytes = access.as_bytes_mut()?;
            (self.kernel)(&mut *bytes);
        } else {
            let access = output.device_access(AccessMode::ReadWrite, &device)?;
            let kernel = Arc::clone(&self.kernel);
            access.dispatch(Box::new(move |bytes: &mut [u8]| kernel(bytes)))?;
        }

        ctx.set_output(0, output)
    }
}
