//! Point set data object: `f32` xyz coordinates in one coherent buffer.

use crate::core::error::{AccessError, AccessResult};
use crate::core::types::{AccessMode, DataKind, ElementType};
use crate::data::access::{DeviceAccess, HostAccess};
use crate::data::coherence::Layout;
use crate::data::mesh::bounds;
use crate::data::object::{DataObject, DataObjectBase};
use crate::device::ExecutionDevice;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

/// A set of 3D points.
#[derive(Debug, Default)]
pub struct PointSet {
    base: DataObjectBase,
}

impl DataObject for PointSet {
    fn base(&self) -> &DataObjectBase {
        &self.base
    }

    fn kind(&self) -> DataKind {
        DataKind::PointSet
    }
}

impl PointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the point set from host data.
    pub fn create(&self, points: &[[f32; 3]]) -> AccessResult<()> {
        let layout = Layout::buffer(ElementType::Float32, 3, points.len())?;
        self.base.store().initialize(
            layout,
            Some((&ExecutionDevice::host(), bytemuck::cast_slice(points))),
        )
    }

    /// Define a zero-filled point set of `count` points.
    pub fn create_empty(&self, count: usize) -> AccessResult<()> {
        let layout = Layout::buffer(ElementType::Float32, 3, count)?;
        self.base.store().initialize(layout, None)
    }

    pub fn len(&self) -> AccessResult<usize> {
        self.base
            .store()
            .layout()
            .map(|l| l.element_count)
            .ok_or(AccessError::NotInitialized)
    }

    pub fn is_empty(&self) -> AccessResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn point_set_access(&self, mode: AccessMode) -> AccessResult<PointSetAccess> {
        Ok(PointSetAccess {
            host: HostAccess::acquire(self.base.store(), mode)?,
        })
    }

    pub fn device_access(
        &self,
        mode: AccessMode,
        device: &ExecutionDevice,
    ) -> AccessResult<DeviceAccess> {
        DeviceAccess::acquire(self.base.store(), device, mode)
    }

    /// Axis-aligned bounding box `(min, max)`, `None` when empty.
    pub fn bounding_box(&self) -> AccessResult<Option<([f32; 3], [f32; 3])>> {
        let access = self.point_set_access(AccessMode::Read)?;
        let points = access.points();
        Ok(bounds(points.iter().copied()))
    }
}

/// Host guard over a point set.
pub struct PointSetAccess {
    host: HostAccess,
}

impl PointSetAccess {
    pub fn points(&self) -> MappedRwLockReadGuard<'_, [[f32; 3]]> {
        MappedRwLockReadGuard::map(self.host.as_bytes(), |b| bytemuck::cast_slice(b))
    }

    /// Mutable points. Requires a READ_WRITE guard.
    pub fn points_mut(&self) -> AccessResult<MappedRwLockWriteGuard<'_, [[f32; 3]]>> {
        Ok(MappedRwLockWriteGuard::map(self.host.as_bytes_mut()?, |b| {
            bytemuck::cast_slice_mut(b)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_round_trip() {
        let set = PointSet::new();
        set.create(&[[1.0, 2.0, 3.0], [-1.0, 0.0, 4.0]]).unwrap();
        assert_eq!(set.len().unwrap(), 2);
        assert_eq!(
            set.bounding_box().unwrap(),
            Some(([-1.0, 0.0, 3.0], [1.0, 2.0, 4.0]))
        );
    }

    #[test]
    fn test_write_through_guard() {
        let set = PointSet::new();
        set.create_empty(1).unwrap();
        let before = set.timestamp();
        {
            let access = set.point_set_access(AccessMode::ReadWrite).unwrap();
            access.points_mut().unwrap()[0] = [7.0, 8.0, 9.0];
        }
        assert!(set.timestamp() > before);
        let access = set.point_set_access(AccessMode::Read).unwrap();
        assert_eq!(access.points()[0], [7.0, 8.0, 9.0]);
        assert!(access.points_mut().is_err());
    }

    #[test]
    fn test_empty_set() {
        let set = PointSet::new();
        assert!(set.len().is_err());
        set.create(&[]).unwrap();
        assert!(set.is_empty().unwrap());
        assert_eq!(set.bounding_box().unwrap(), None);
    }
}
