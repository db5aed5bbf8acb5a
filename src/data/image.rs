//! Image data object.
//!
//! An image is a 2D or 3D surface of interleaved components. Its shape is
//! fixed by `create_*` until the next `create_*`; every accessor on an image
//! that was never created fails with [`AccessError::NotInitialized`].

use crate::core::error::{AccessError, AccessResult, HeteroflowResult};
use crate::core::types::{AccessMode, DataKind, ElementType, IntensityStats};
use crate::data::access::{DeviceAccess, HostAccess};
use crate::data::coherence::{Layout, LayoutKind};
use crate::data::mesh::bounds;
use crate::data::object::{DataObject, DataObjectBase};
use crate::device::ExecutionDevice;
use image::{DynamicImage, ImageBuffer};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Spatial metadata of an image. Not part of its content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Physical size of one voxel along each axis
    pub spacing: [f32; 3],
    /// Position of the first voxel
    pub offset: [f32; 3],
    /// Row-major 4x4 transform to world space
    pub transform: [[f32; 4]; 4],
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            spacing: [1.0; 3],
            offset: [0.0; 3],
            transform: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }
}

/// A 2D or 3D image.
#[derive(Debug, Default)]
pub struct Image {
    base: DataObjectBase,
    metadata: RwLock<ImageMetadata>,
    statistics: Mutex<Option<(u64, IntensityStats)>>,
}

impl DataObject for Image {
    fn base(&self) -> &DataObjectBase {
        &self.base
    }

    fn kind(&self) -> DataKind {
        DataKind::Image
    }
}

impl Image {
    /// An uninitialized image.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------------

    /// Define a zero-filled 2D image.
    pub fn create_2d(
        &self,
        width: u32,
        height: u32,
        element_type: ElementType,
        components: u32,
    ) -> AccessResult<()> {
        let layout = Layout::surface([width, height, 1], 2, element_type, components)?;
        self.base.store().initialize(layout, None)
    }

    /// Define a 2D image holding `data` on `device`.
    ///
    /// `data` must hold exactly `width * height * components * size_of(type)`
    /// bytes, row-major and component-interleaved.
    pub fn create_2d_with_data(
        &self,
        width: u32,
        height: u32,
        element_type: ElementType,
        components: u32,
        device: &ExecutionDevice,
        data: &[u8],
    ) -> AccessResult<()> {
        let layout = Layout::surface([width, height, 1], 2, element_type, components)?;
        self.base.store().initialize(layout, Some((device, data)))
    }

    /// Define a zero-filled 3D image.
    pub fn create_3d(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        element_type: ElementType,
        components: u32,
    ) -> AccessResult<()> {
        let layout = Layout::surface([width, height, depth], 3, element_type, components)?;
        self.base.store().initialize(layout, None)
    }

    /// Define a 3D image holding `data` on `device`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_3d_with_data(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        element_type: ElementType,
        components: u32,
        device: &ExecutionDevice,
        data: &[u8],
    ) -> AccessResult<()> {
        let layout = Layout::surface([width, height, depth], 3, element_type, components)?;
        self.base.store().initialize(layout, Some((device, data)))
    }

    /// Take the shape, type and metadata of `other`, zero-filled.
    pub fn create_from_image(&self, other: &Image) -> AccessResult<()> {
        let layout = other.layout()?;
        self.base.store().initialize(layout, None)?;
        *self.metadata.write() = other.metadata();
        Ok(())
    }

    /// A new image with the same content, copied on `device`.
    pub fn copy(&self, device: &ExecutionDevice) -> AccessResult<Image> {
        let copy = Image::new();
        copy.base.store().copy_from(self.base.store(), device)?;
        *copy.metadata.write() = self.metadata();
        Ok(copy)
    }

    // ------------------------------------------------------------------------
    // Shape
    // ------------------------------------------------------------------------

    fn layout(&self) -> AccessResult<Layout> {
        self.base.store().require_layout()
    }

    fn surface(&self) -> AccessResult<([u32; 3], u8)> {
        match self.layout()?.kind {
            LayoutKind::Surface { size, dimensions } => Ok((size, dimensions)),
            LayoutKind::Buffer => Err(AccessError::invalid_dimensions("image has no surface shape")),
        }
    }

    /// Whether `create_*` has been called.
    pub fn is_initialized(&self) -> bool {
        self.base.store().is_initialized()
    }

    pub fn width(&self) -> AccessResult<u32> {
        Ok(self.surface()?.0[0])
    }

    pub fn height(&self) -> AccessResult<u32> {
        Ok(self.surface()?.0[1])
    }

    /// Depth; 1 for 2D images.
    pub fn depth(&self) -> AccessResult<u32> {
        Ok(self.surface()?.0[2])
    }

    /// 2 or 3.
    pub fn dimensions(&self) -> AccessResult<u8> {
        Ok(self.surface()?.1)
    }

    /// `[width, height, depth]`.
    pub fn size(&self) -> AccessResult<[u32; 3]> {
        Ok(self.surface()?.0)
    }

    pub fn element_type(&self) -> AccessResult<ElementType> {
        Ok(self.layout()?.element_type)
    }

    pub fn components(&self) -> AccessResult<u32> {
        Ok(self.layout()?.components)
    }

    /// Number of pixels or voxels.
    pub fn element_count(&self) -> AccessResult<usize> {
        Ok(self.layout()?.element_count)
    }

    /// Size of the content in bytes.
    pub fn byte_len(&self) -> AccessResult<usize> {
        Ok(self.layout()?.byte_len())
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    pub fn metadata(&self) -> ImageMetadata {
        *self.metadata.read()
    }

    pub fn spacing(&self) -> [f32; 3] {
        self.metadata.read().spacing
    }

    pub fn set_spacing(&self, spacing: [f32; 3]) {
        self.metadata.write().spacing = spacing;
    }

    pub fn offset(&self) -> [f32; 3] {
        self.metadata.read().offset
    }

    pub fn set_offset(&self, offset: [f32; 3]) {
        self.metadata.write().offset = offset;
    }

    pub fn transform(&self) -> [[f32; 4]; 4] {
        self.metadata.read().transform
    }

    pub fn set_transform(&self, transform: [[f32; 4]; 4]) {
        self.metadata.write().transform = transform;
    }

    /// Box spanned by the image in voxel units, `(min, max)`.
    ///
    /// The depth extent of a 2D image is zero.
    pub fn bounding_box(&self) -> AccessResult<([f32; 3], [f32; 3])> {
        let ([width, height, depth], dimensions) = self.surface()?;
        let depth = if dimensions == 2 { 0.0 } else { depth as f32 };
        Ok(([0.0; 3], [width as f32, height as f32, depth]))
    }

    /// World-space axis-aligned box: every corner scaled by the spacing,
    /// shifted by the offset and mapped through the transform.
    pub fn transformed_bounding_box(&self) -> AccessResult<([f32; 3], [f32; 3])> {
        let (_, extent) = self.bounding_box()?;
        let ImageMetadata {
            spacing,
            offset,
            transform,
        } = self.metadata();

        let corners = (0..8u8).map(|corner| {
            let mut local = [0.0f32; 3];
            for axis in 0..3 {
                let reach = if corner & (1 << axis) != 0 { extent[axis] } else { 0.0 };
                local[axis] = offset[axis] + reach * spacing[axis];
            }
            let mut world = [0.0f32; 3];
            for (row, value) in transform.iter().zip(world.iter_mut()) {
                *value = row[0] * local[0] + row[1] * local[1] + row[2] * local[2] + row[3];
            }
            world
        });
        bounds(corners).ok_or(AccessError::NotInitialized)
    }

    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    /// Open a guard on the host representation.
    pub fn image_access(&self, mode: AccessMode) -> AccessResult<HostAccess> {
        HostAccess::acquire(self.base.store(), mode)
    }

    /// Open a guard on the surface held by `device`.
    pub fn device_access(
        &self,
        mode: AccessMode,
        device: &ExecutionDevice,
    ) -> AccessResult<DeviceAccess> {
        DeviceAccess::acquire(self.base.store(), device, mode)
    }

    /// Minimum, maximum and mean over every component.
    ///
    /// Cached until the content changes.
    pub fn intensity_statistics(&self) -> AccessResult<IntensityStats> {
        let timestamp = self.timestamp();
        if let Some((cached_at, stats)) = *self.statistics.lock() {
            if cached_at == timestamp {
                return Ok(stats);
            }
        }

        let access = self.image_access(AccessMode::Read)?;
        let stats = access
            .statistics()
            .ok_or_else(|| AccessError::invalid_dimensions("image has no elements"))?;
        *self.statistics.lock() = Some((timestamp, stats));
        Ok(stats)
    }

    pub fn minimum_intensity(&self) -> AccessResult<f64> {
        Ok(self.intensity_statistics()?.minimum)
    }

    pub fn maximum_intensity(&self) -> AccessResult<f64> {
        Ok(self.intensity_statistics()?.maximum)
    }

    pub fn average_intensity(&self) -> AccessResult<f64> {
        Ok(self.intensity_statistics()?.mean)
    }

    // ------------------------------------------------------------------------
    // image crate interop
    // ------------------------------------------------------------------------

    /// Build a 2D host image from a decoded `DynamicImage`.
    ///
    /// 8-bit, 16-bit and float formats keep their element type; any other
    /// format is converted to 8-bit RGBA.
    pub fn from_dynamic(source: &DynamicImage) -> HeteroflowResult<Image> {
        let (width, height) = (source.width(), source.height());
        let (element_type, components, bytes): (ElementType, u32, Vec<u8>) = match source {
            DynamicImage::ImageLuma8(b) => (ElementType::UInt8, 1, b.as_raw().clone()),
            DynamicImage::ImageLumaA8(b) => (ElementType::UInt8, 2, b.as_raw().clone()),
            DynamicImage::ImageRgb8(b) => (ElementType::UInt8, 3, b.as_raw().clone()),
            DynamicImage::ImageRgba8(b) => (ElementType::UInt8, 4, b.as_raw().clone()),
            DynamicImage::ImageLuma16(b) => {
                (ElementType::UInt16, 1, bytemuck::cast_slice(b.as_raw().as_slice()).to_vec())
            }
            DynamicImage::ImageLumaA16(b) => {
                (ElementType::UInt16, 2, bytemuck::cast_slice(b.as_raw().as_slice()).to_vec())
            }
            DynamicImage::ImageRgb16(b) => {
                (ElementType::UInt16, 3, bytemuck::cast_slice(b.as_raw().as_slice()).to_vec())
            }
            DynamicImage::ImageRgba16(b) => {
                (ElementType::UInt16, 4, bytemuck::cast_slice(b.as_raw().as_slice()).to_vec())
            }
            DynamicImage::ImageRgb32F(b) => {
                (ElementType::Float32, 3, bytemuck::cast_slice(b.as_raw().as_slice()).to_vec())
            }
            DynamicImage::ImageRgba32F(b) => {
                (ElementType::Float32, 4, bytemuck::cast_slice(b.as_raw().as_slice()).to_vec())
            }
            other => (ElementType::UInt8, 4, other.to_rgba8().into_raw()),
        };

        let image = Image::new();
        image.create_2d_with_data(
            width,
            height,
            element_type,
            components,
            &ExecutionDevice::host(),
            &bytes,
        )?;
        Ok(image)
    }

    /// Convert a 2D image to a `DynamicImage`.
    ///
    /// Supported: UInt8 and UInt16 with 1 to 4 components, Float32 with 3 or
    /// 4 components.
    pub fn to_dynamic(&self) -> HeteroflowResult<DynamicImage> {
        let layout = self.layout()?;
        let (size, dimensions) = self.surface()?;
        if dimensions != 2 {
            return Err(AccessError::invalid_dimensions("only 2D images convert to DynamicImage").into());
        }
        let (width, height) = (size[0], size[1]);
        let access = self.image_access(AccessMode::Read)?;
        let unsupported = || {
            AccessError::invalid_dimensions(format!(
                "no DynamicImage format for {} components of {}",
                layout.components, layout.element_type
            ))
        };

        let converted = match (layout.element_type, layout.components) {
            (ElementType::UInt8, n) => {
                let raw = access.as_slice::<u8>()?.to_vec();
                match n {
                    1 => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
                    2 => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageLumaA8),
                    3 => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
                    _ => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageRgba8),
                }
            }
            (ElementType::UInt16, n) => {
                let raw = access.as_slice::<u16>()?.to_vec();
                match n {
                    1 => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageLuma16),
                    2 => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageLumaA16),
                    3 => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageRgb16),
                    _ => ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageRgba16),
                }
            }
            (ElementType::Float32, 3) => {
                let raw = access.as_slice::<f32>()?.to_vec();
                ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageRgb32F)
            }
            (ElementType::Float32, 4) => {
                let raw = access.as_slice::<f32>()?.to_vec();
                ImageBuffer::from_raw(width, height, raw).map(DynamicImage::ImageRgba32F)
            }
            _ => None,
        };
        Ok(converted.ok_or_else(unsupported)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use std::sync::Arc;

    #[test]
    fn test_uninitialized_accessors_fail() {
        let image = Image::new();
        assert_eq!(image.width(), Err(AccessError::NotInitialized));
        assert_eq!(image.element_type(), Err(AccessError::NotInitialized));
        assert!(image.image_access(AccessMode::Read).is_err());
    }

    #[test]
    fn test_create_2d_zeroed() {
        let image = Image::new();
        image.create_2d(8, 4, ElementType::Int16, 2).unwrap();
        assert_eq!(image.size().unwrap(), [8, 4, 1]);
        assert_eq!(image.dimensions().unwrap(), 2);
        let access = image.image_access(AccessMode::Read).unwrap();
        assert_eq!(access.as_bytes().len(), 8 * 4 * 2 * 2);
        assert!(access.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_rejects_bad_shape() {
        let image = Image::new();
        assert!(matches!(
            image.create_2d(0, 4, ElementType::UInt8, 1),
            Err(AccessError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            image.create_2d_with_data(2, 2, ElementType::UInt8, 1, &ExecutionDevice::host(), &[0; 3]),
            Err(AccessError::InvalidDimensions { .. })
        ));
        assert!(!image.is_initialized());
    }

    #[test]
    fn test_statistics_cached_until_write() {
        let image = Image::new();
        let data: Vec<u8> = vec![2, 4, 6, 8];
        image
            .create_2d_with_data(2, 2, ElementType::UInt8, 1, &ExecutionDevice::host(), &data)
            .unwrap();
        assert_eq!(image.average_intensity().unwrap(), 5.0);
        assert_eq!(image.maximum_intensity().unwrap(), 8.0);

        {
            let access = image.image_access(AccessMode::ReadWrite).unwrap();
            access.as_bytes_mut().unwrap()[0] = 10;
        }
        assert_eq!(image.maximum_intensity().unwrap(), 10.0);
        assert_eq!(image.minimum_intensity().unwrap(), 4.0);
    }

    #[test]
    fn test_copy_and_create_from_image() {
        let device = ExecutionDevice::accelerator(Arc::new(SimulatedDevice::new("sim")));
        let image = Image::new();
        image
            .create_2d_with_data(2, 1, ElementType::UInt8, 3, &ExecutionDevice::host(), &[1, 2, 3, 4, 5, 6])
            .unwrap();
        image.set_spacing([0.5, 0.5, 1.0]);

        let copy = image.copy(&device).unwrap();
        assert_ne!(copy.id(), image.id());
        assert_eq!(copy.spacing(), [0.5, 0.5, 1.0]);
        let access = copy.image_access(AccessMode::Read).unwrap();
        assert_eq!(&*access.as_bytes(), &[1, 2, 3, 4, 5, 6]);

        let shaped = Image::new();
        shaped.create_from_image(&image).unwrap();
        assert_eq!(shaped.components().unwrap(), 3);
        assert_eq!(shaped.maximum_intensity().unwrap(), 0.0);
    }

    #[test]
    fn test_dynamic_image_conversion() {
        let gray = image::GrayImage::from_fn(3, 2, |x, y| image::Luma([(x + y * 3) as u8]));
        let image = Image::from_dynamic(&DynamicImage::ImageLuma8(gray)).unwrap();
        assert_eq!(image.size().unwrap(), [3, 2, 1]);
        assert_eq!(image.maximum_intensity().unwrap(), 5.0);

        let back = image.to_dynamic().unwrap();
        assert_eq!(back.width(), 3);
        assert_eq!(back.as_luma8().unwrap().get_pixel(2, 1).0, [5]);
    }

    #[test]
    fn test_dynamic_image_rejects_3d() {
        let image = Image::new();
        image.create_3d(2, 2, 2, ElementType::UInt8, 1).unwrap();
        assert!(image.to_dynamic().is_err());
    }

    #[test]
    fn test_bounding_boxes() {
        let image = Image::new();
        image.create_2d(4, 2, ElementType::UInt8, 1).unwrap();
        assert_eq!(image.bounding_box().unwrap(), ([0.0; 3], [4.0, 2.0, 0.0]));

        image.set_spacing([0.5, 2.0, 1.0]);
        image.set_offset([1.0, 0.0, 0.0]);
        // Quarter turn about z, then 10 along x.
        image.set_transform([
            [0.0, -1.0, 0.0, 10.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        assert_eq!(
            image.transformed_bounding_box().unwrap(),
            ([6.0, 1.0, 0.0], [10.0, 3.0, 0.0])
        );

        let volume = Image::new();
        volume.create_3d(2, 3, 4, ElementType::UInt8, 1).unwrap();
        assert_eq!(
            volume.transformed_bounding_box().unwrap(),
            ([0.0; 3], [2.0, 3.0, 4.0])
        );
        assert_eq!(Image::new().bounding_box(), Err(AccessError::NotInitialized));
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let image = Image::new();
        let result = image.create_3d(1 << 22, 1 << 22, 1 << 22, ElementType::Float32, 4);
        assert!(matches!(result, Err(AccessError::InvalidDimensions { .. })));
        assert!(!image.is_initialized());

        let result = image.create_2d(u32::MAX, u32::MAX, ElementType::Float32, 4);
        assert!(matches!(result, Err(AccessError::InvalidDimensions { .. })));
    }
}
