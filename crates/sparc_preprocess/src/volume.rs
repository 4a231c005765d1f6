//! Plane-addressable image volumes.

use ndarray::{s, Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{PreprocessError, Result};

/// Element type of stored pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    U8,
    U16,
    U32,
    F32,
    F64,
}

impl PixelType {
    pub fn is_integer(&self) -> bool {
        matches!(self, PixelType::U8 | PixelType::U16 | PixelType::U32)
    }

    pub fn byte_size(&self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::U32 | PixelType::F32 => 4,
            PixelType::F64 => 8,
        }
    }

    /// Zarr v2 dtype string (little-endian).
    pub fn zarr_dtype(&self) -> &'static str {
        match self {
            PixelType::U8 => "|u1",
            PixelType::U16 => "<u2",
            PixelType::U32 => "<u4",
            PixelType::F32 => "<f4",
            PixelType::F64 => "<f8",
        }
    }

    pub fn from_zarr_dtype(dtype: &str) -> Option<Self> {
        match dtype {
            "|u1" | "<u1" => Some(PixelType::U8),
            "<u2" => Some(PixelType::U16),
            "<u4" => Some(PixelType::U32),
            "<f4" => Some(PixelType::F32),
            "<f8" => Some(PixelType::F64),
            _ => None,
        }
    }
}

/// Floating precision of computed outputs.
///
/// Integer input is promoted to single precision; floating input keeps
/// its own precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F32,
    F64,
}

impl Precision {
    pub fn for_input(pixel_type: PixelType) -> Self {
        match pixel_type {
            PixelType::F64 => Precision::F64,
            _ => Precision::F32,
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            Precision::F32 => PixelType::F32,
            Precision::F64 => PixelType::F64,
        }
    }

    /// Round a computed value to this precision.
    pub fn round(&self, value: f64) -> f64 {
        match self {
            Precision::F32 => value as f32 as f64,
            Precision::F64 => value,
        }
    }
}

/// Anything that can hand out single `(c, z)` planes of a CZYX volume.
///
/// Implementations must be safe to read from several threads; the engine
/// never asks for more than one plane per task.
pub trait PlaneSource: Send + Sync {
    /// `[c, z, y, x]`
    fn shape(&self) -> [usize; 4];

    fn pixel_type(&self) -> PixelType;

    fn read_plane(&self, c: usize, z: usize) -> Result<Array2<f64>>;
}

/// Owned CZYX pixel data in its native element type.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeData {
    U8(Array4<u8>),
    U16(Array4<u16>),
    U32(Array4<u32>),
    F32(Array4<f32>),
    F64(Array4<f64>),
}

/// In-memory CZYX volume.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVolume {
    data: VolumeData,
}

impl ImageVolume {
    pub fn new(data: VolumeData) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &VolumeData {
        &self.data
    }

    pub fn into_data(self) -> VolumeData {
        self.data
    }
}

macro_rules! volume_from {
    ($ty:ty, $variant:ident) => {
        impl From<Array4<$ty>> for ImageVolume {
            fn from(array: Array4<$ty>) -> Self {
                ImageVolume::new(VolumeData::$variant(array))
            }
        }
    };
}

volume_from!(u8, U8);
volume_from!(u16, U16);
volume_from!(u32, U32);
volume_from!(f32, F32);
volume_from!(f64, F64);

impl PlaneSource for ImageVolume {
    fn shape(&self) -> [usize; 4] {
        let dim = match &self.data {
            VolumeData::U8(a) => a.dim(),
            VolumeData::U16(a) => a.dim(),
            VolumeData::U32(a) => a.dim(),
            VolumeData::F32(a) => a.dim(),
            VolumeData::F64(a) => a.dim(),
        };
        [dim.0, dim.1, dim.2, dim.3]
    }

    fn pixel_type(&self) -> PixelType {
        match &self.data {
            VolumeData::U8(_) => PixelType::U8,
            VolumeData::U16(_) => PixelType::U16,
            VolumeData::U32(_) => PixelType::U32,
            VolumeData::F32(_) => PixelType::F32,
            VolumeData::F64(_) => PixelType::F64,
        }
    }

    fn read_plane(&self, c: usize, z: usize) -> Result<Array2<f64>> {
        let [cs, zs, _, _] = self.shape();
        if c >= cs || z >= zs {
            return Err(PreprocessError::Source {
                c,
                z,
                message: format!("plane outside volume of {cs} channels and {zs} slices"),
            });
        }
        let plane = match &self.data {
            VolumeData::U8(a) => a.slice(s![c, z, .., ..]).mapv(f64::from),
            VolumeData::U16(a) => a.slice(s![c, z, .., ..]).mapv(f64::from),
            VolumeData::U32(a) => a.slice(s![c, z, .., ..]).mapv(f64::from),
            VolumeData::F32(a) => a.slice(s![c, z, .., ..]).mapv(f64::from),
            VolumeData::F64(a) => a.slice(s![c, z, .., ..]).to_owned(),
        };
        Ok(plane)
    }
}
