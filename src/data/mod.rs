//! Data objects and their coherence layer.
//!
//! - [`coherence`]: per-object representation tracking and transfers
//! - [`access`]: scoped host and device access guards
//! - [`Image`], [`Mesh`], [`PointSet`]: typed payloads
//!
//! Objects flow between stages as [`Data`], a closed enum over the
//! payload types sharing each object through an `Arc`.

pub mod access;
pub mod coherence;
pub mod image;
pub mod mesh;
pub mod object;
pub mod point_set;

pub use access::{DeviceAccess, HostAccess};
pub use coherence::{CoherenceState, CoherenceStore, Layout, LayoutKind, Retention, TransferCounts};
pub use self::image::{Image, ImageMetadata};
pub use mesh::{Mesh, MeshAccess, MeshVertex};
pub use object::{next_timestamp, DataObject, DataObjectBase};
pub use point_set::{PointSet, PointSetAccess};

use crate::core::error::DataId;
use crate::core::types::DataKind;
use std::sync::Arc;

/// A data object travelling along a pipeline edge.
#[derive(Debug, Clone)]
pub enum Data {
    Image(Arc<Image>),
    Mesh(Arc<Mesh>),
    PointSet(Arc<PointSet>),
}

impl Data {
    /// The object behind the handle.
    pub fn object(&self) -> &dyn DataObject {
        match self {
            Data::Image(image) => image.as_ref(),
            Data::Mesh(mesh) => mesh.as_ref(),
            Data::PointSet(points) => points.as_ref(),
        }
    }

    pub fn kind(&self) -> DataKind {
        self.object().kind()
    }

    pub fn id(&self) -> DataId {
        self.object().id()
    }

    /// Modification timestamp of the object.
    pub fn timestamp(&self) -> u64 {
        self.object().timestamp()
    }

    pub fn as_image(&self) -> Option<&Arc<Image>> {
        match self {
            Data::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_mesh(&self) -> Option<&Arc<Mesh>> {
        match self {
            Data::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_point_set(&self) -> Option<&Arc<PointSet>> {
        match self {
            Data::PointSet(points) => Some(points),
            _ => None,
        }
    }

    /// Whether both handles refer to the same object.
    pub fn same_object(&self, other: &Data) -> bool {
        self.id() == other.id()
    }
}

impl From<Image> for Data {
    fn from(image: Image) -> Self {
        Data::Image(Arc::new(image))
    }
}

impl From<Arc<Image>> for Data {
    fn from(image: Arc<Image>) -> Self {
        Data::Image(image)
    }
}

impl From<Mesh> for Data {
    fn from(mesh: Mesh) -> Self {
        Data::Mesh(Arc::new(mesh))
    }
}

impl From<Arc<Mesh>> for Data {
    fn from(mesh: Arc<Mesh>) -> Self {
        Data::Mesh(mesh)
    }
}

impl From<PointSet> for Data {
    fn from(points: PointSet) -> Self {
        Data::PointSet(Arc::new(points))
    }
}

impl From<Arc<PointSet>> for Data {
    fn from(points: Arc<PointSet>) -> Self {
        Data::PointSet(points)
    }
}
