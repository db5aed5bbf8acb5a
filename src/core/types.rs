//! Core value types shared by the coherence layer and the scheduler.
//!
//! Element types form a closed enum: every supported pixel/vertex component
//! type is listed here, and the typed view of a byte buffer is resolved once
//! per call through [`ElementSlice`] instead of switching on the type at every
//! call site.

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Component type of the elements stored in a data object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
}

impl ElementType {
    /// Size of one component in bytes.
    pub fn size_of(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
        }
    }

    /// Get all element types.
    pub fn all() -> &'static [ElementType] {
        &[
            ElementType::Int8,
            ElementType::UInt8,
            ElementType::Int16,
            ElementType::UInt16,
            ElementType::Int32,
            ElementType::UInt32,
            ElementType::Float32,
        ]
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Int8 => "int8",
            ElementType::UInt8 => "uint8",
            ElementType::Int16 => "int16",
            ElementType::UInt16 => "uint16",
            ElementType::Int32 => "int32",
            ElementType::UInt32 => "uint32",
            ElementType::Float32 => "float32",
        };
        write!(f, "{}", name)
    }
}

/// A Rust primitive that can be stored as an element of a data object.
pub trait Element: Pod + Into<f64> + Send + Sync + 'static {
    /// The matching runtime element type.
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: ElementType = ElementType::$variant;
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    f32 => Float32,
}

/// A byte buffer viewed as a slice of its element type.
#[derive(Debug, Clone, Copy)]
pub enum ElementSlice<'a> {
    Int8(&'a [i8]),
    UInt8(&'a [u8]),
    Int16(&'a [i16]),
    UInt16(&'a [u16]),
    Int32(&'a [i32]),
    UInt32(&'a [u32]),
    Float32(&'a [f32]),
}

impl<'a> ElementSlice<'a> {
    /// Resolve a byte buffer into a typed view.
    ///
    /// Returns `None` when the buffer is misaligned or its length is not a
    /// multiple of the element size.
    pub fn from_bytes(element_type: ElementType, bytes: &'a [u8]) -> Option<Self> {
        Some(match element_type {
            ElementType::Int8 => ElementSlice::Int8(bytemuck::try_cast_slice(bytes).ok()?),
            ElementType::UInt8 => ElementSlice::UInt8(bytes),
            ElementType::Int16 => ElementSlice::Int16(bytemuck::try_cast_slice(bytes).ok()?),
            ElementType::UInt16 => ElementSlice::UInt16(bytemuck::try_cast_slice(bytes).ok()?),
            ElementType::Int32 => ElementSlice::Int32(bytemuck::try_cast_slice(bytes).ok()?),
            ElementType::UInt32 => ElementSlice::UInt32(bytemuck::try_cast_slice(bytes).ok()?),
            ElementType::Float32 => ElementSlice::Float32(bytemuck::try_cast_slice(bytes).ok()?),
        })
    }

    /// Number of components in the view.
    pub fn len(&self) -> usize {
        match self {
            ElementSlice::Int8(s) => s.len(),
            ElementSlice::UInt8(s) => s.len(),
            ElementSlice::Int16(s) => s.len(),
            ElementSlice::UInt16(s) => s.len(),
            ElementSlice::Int32(s) => s.len(),
            ElementSlice::UInt32(s) => s.len(),
            ElementSlice::Float32(s) => s.len(),
        }
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute summary statistics over every component.
    pub fn statistics(&self) -> Option<IntensityStats> {
        match self {
            ElementSlice::Int8(s) => IntensityStats::of(s),
            ElementSlice::UInt8(s) => IntensityStats::of(s),
            ElementSlice::Int16(s) => IntensityStats::of(s),
            ElementSlice::UInt16(s) => IntensityStats::of(s),
            ElementSlice::Int32(s) => IntensityStats::of(s),
            ElementSlice::UInt32(s) => IntensityStats::of(s),
            ElementSlice::Float32(s) => IntensityStats::of(s),
        }
    }
}

/// Minimum, maximum and mean over the components of a data object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityStats {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
}

impl IntensityStats {
    /// Compute statistics over a typed slice. Returns `None` for an empty slice.
    pub fn of<T: Element>(values: &[T]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut minimum = f64::INFINITY;
        let mut maximum = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &value in values {
            let v: f64 = value.into();
            minimum = minimum.min(v);
            maximum = maximum.max(v);
            sum += v;
        }
        Some(Self {
            minimum,
            maximum,
            mean: sum / values.len() as f64,
        })
    }
}

/// Kind of data object a port accepts or produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Image,
    Mesh,
    PointSet,
    /// Accepts any kind (for generic stages)
    Any,
}

impl DataKind {
    /// Check whether a value of `other` can flow into a port of this kind.
    pub fn accepts(&self, other: DataKind) -> bool {
        *self == DataKind::Any || other == DataKind::Any || *self == other
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Image => write!(f, "Image"),
            DataKind::Mesh => write!(f, "Mesh"),
            DataKind::PointSet => write!(f, "PointSet"),
            DataKind::Any => write!(f, "Any"),
        }
    }
}

/// Access mode requested from an access guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    ReadWrite,
}
