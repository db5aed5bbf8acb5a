//! Triangle mesh data object.
//!
//! Vertices (position and normal) and triangles (vertex index triples) are
//! packed into one coherent buffer: vertices first, triangles after.

use crate::core::error::{AccessError, AccessResult};
use crate::core::types::{AccessMode, DataKind, ElementType};
use crate::data::access::{DeviceAccess, HostAccess};
use crate::data::coherence::Layout;
use crate::data::object::{DataObject, DataObjectBase};
use crate::device::ExecutionDevice;
use bytemuck::{Pod, Zeroable};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock};
use serde::{Deserialize, Serialize};

/// One mesh vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl MeshVertex {
    pub fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
        Self { position, normal }
    }
}

const VERTEX_WORDS: usize = std::mem::size_of::<MeshVertex>() / 4;

/// A triangle mesh.
#[derive(Debug, Default)]
pub struct Mesh {
    base: DataObjectBase,
    counts: RwLock<Option<(usize, usize)>>,
}

impl DataObject for Mesh {
    fn base(&self) -> &DataObjectBase {
        &self.base
    }

    fn kind(&self) -> DataKind {
        DataKind::Mesh
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the mesh from host data.
    ///
    /// Every triangle index must refer to an existing vertex.
    pub fn create(&self, vertices: &[MeshVertex], triangles: &[[u32; 3]]) -> AccessResult<()> {
        if let Some(bad) = triangles
            .iter()
            .flatten()
            .find(|&&index| index as usize >= vertices.len())
        {
            return Err(AccessError::invalid_dimensions(format!(
                "triangle index {} out of range for {} vertices",
                bad,
                vertices.len()
            )));
        }

        let words = vertices
            .len()
            .checked_mul(VERTEX_WORDS)
            .zip(triangles.len().checked_mul(3))
            .and_then(|(v, t)| v.checked_add(t))
            .ok_or_else(|| AccessError::invalid_dimensions("mesh too large"))?;
        let layout = Layout::buffer(ElementType::UInt32, 1, words)?;
        let mut bytes = Vec::with_capacity(layout.byte_len());
        bytes.extend_from_slice(bytemuck::cast_slice(vertices));
        bytes.extend_from_slice(bytemuck::cast_slice(triangles));

        // Counts change together with the buffer.
        let mut counts = self.counts.write();
        self.base
            .store()
            .initialize(layout, Some((&ExecutionDevice::host(), &bytes)))?;
        *counts = Some((vertices.len(), triangles.len()));
        Ok(())
    }

    fn counts(&self) -> AccessResult<(usize, usize)> {
        self.counts.read().ok_or(AccessError::NotInitialized)
    }

    pub fn vertex_count(&self) -> AccessResult<usize> {
        Ok(self.counts()?.0)
    }

    pub fn triangle_count(&self) -> AccessResult<usize> {
        Ok(self.counts()?.1)
    }

    /// Open a guard on the host copy of the mesh.
    pub fn mesh_access(&self, mode: AccessMode) -> AccessResult<MeshAccess> {
        // Held until the guard is open; `create` fails while it is.
        let counts = self.counts.read();
        let (vertex_count, triangle_count) = counts.ok_or(AccessError::NotInitialized)?;
        let host = HostAccess::acquire(self.base.store(), mode)?;
        drop(counts);
        Ok(MeshAccess {
            host,
            vertex_count,
            triangle_count,
        })
    }

    /// Open a guard on the packed buffer held by `device`.
    pub fn device_access(
        &self,
        mode: AccessMode,
        device: &ExecutionDevice,
    ) -> AccessResult<DeviceAccess> {
        DeviceAccess::acquire(self.base.store(), device, mode)
    }

    /// Axis-aligned bounding box `(min, max)` of all vertex positions.
    pub fn bounding_box(&self) -> AccessResult<Option<([f32; 3], [f32; 3])>> {
        let access = self.mesh_access(AccessMode::Read)?;
        let vertices = access.vertices();
        Ok(bounds(vertices.iter().map(|v| v.position)))
    }
}

pub(crate) fn bounds(points: impl Iterator<Item = [f32; 3]>) -> Option<([f32; 3], [f32; 3])> {
    points.fold(None, |acc, p| {
        let (mut lo, mut hi) = acc.unwrap_or((p, p));
        for axis in 0..3 {
            lo[axis] = lo[axis].min(p[axis]);
            hi[axis] = hi[axis].max(p[axis]);
        }
        Some((lo, hi))
    })
}

/// Host guard over a mesh.
pub struct MeshAccess {
    host: HostAccess,
    vertex_count: usize,
    triangle_count: usize,
}

impl MeshAccess {
    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    fn split(&self) -> usize {
        self.vertex_count * std::mem::size_of::<MeshVertex>()
    }

    pub fn vertices(&self) -> MappedRwLockReadGuard<'_, [MeshVertex]> {
        let split = self.split();
        MappedRwLockReadGuard::map(self.host.as_bytes(), |b| bytemuck::cast_slice(&b[..split]))
    }

    pub fn triangles(&self) -> MappedRwLockReadGuard<'_, [[u32; 3]]> {
        let split = self.split();
        MappedRwLockReadGuard::map(self.host.as_bytes(), |b| bytemuck::cast_slice(&b[split..]))
    }

    /// Mutable vertices. Requires a READ_WRITE guard.
    pub fn vertices_mut(&self) -> AccessResult<MappedRwLockWriteGuard<'_, [MeshVertex]>> {
        let split = self.split();
        Ok(MappedRwLockWriteGuard::map(self.host.as_bytes_mut()?, |b| {
            bytemuck::cast_slice_mut(&mut b[..split])
        }))
    }
}
