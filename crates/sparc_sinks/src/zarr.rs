//! Zarr v2 directory stores.
//!
//! Arrays are CZYX, uncompressed, C order, chunked as `(1, 1, tile, tile)`
//! with dot-separated chunk keys. Writers stage into a hidden sibling
//! directory and rename into place on commit, so a component is either
//! absent or complete.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sparc_preprocess::{ImageVolume, PixelType, PlaneSource, PreprocessError, VolumeData};
use sparc_protocol::defaults::STORE_TILE_EDGE;
use sparc_protocol::PhysicalScale;
use tracing::{debug, warn};

use crate::error::{SinkError, SinkResult};

const ZGROUP: &str = ".zgroup";
const ZARRAY: &str = ".zarray";
const ZATTRS: &str = ".zattrs";

/// Pixel element with a little-endian byte encoding.
pub trait Element: Copy + Send + Sync + 'static {
    const PIXEL_TYPE: PixelType;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;

    fn to_f64(self) -> f64;

    fn zero() -> Self;
}

macro_rules! element {
    ($ty:ty, $pixel:ident, $size:expr) => {
        impl Element for $ty {
            const PIXEL_TYPE: PixelType = PixelType::$pixel;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size];
                buf.copy_from_slice(&bytes[..$size]);
                <$ty>::from_le_bytes(buf)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn zero() -> Self {
                0 as $ty
            }
        }
    };
}

element!(u8, U8, 1);
element!(u16, U16, 2);
element!(u32, U32, 4);
element!(f32, F32, 4);
element!(f64, F64, 8);

fn default_separator() -> String {
    ".".to_string()
}

/// Contents of a `.zarray` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub zarr_format: u32,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
    pub compressor: Option<Value>,
    pub fill_value: Option<Value>,
    pub order: String,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default = "default_separator")]
    pub dimension_separator: String,
}

impl ArrayMeta {
    /// CZYX metadata with one chunk per spatial tile of each plane.
    pub fn czyx(shape: [usize; 4], pixel_type: PixelType) -> Self {
        let [_, _, y, x] = shape;
        Self {
            zarr_format: 2,
            shape: shape.to_vec(),
            chunks: vec![1, 1, y.clamp(1, STORE_TILE_EDGE), x.clamp(1, STORE_TILE_EDGE)],
            dtype: pixel_type.zarr_dtype().to_string(),
            compressor: None,
            fill_value: Some(json!(0)),
            order: "C".to_string(),
            filters: None,
            dimension_separator: default_separator(),
        }
    }

    fn tile(&self) -> (usize, usize) {
        (self.chunks[2], self.chunks[3])
    }
}

/// One OME-NGFF 0.4 `multiscales` entry: CZYX axes and a single
/// resolution level stored at `dataset`.
pub fn multiscale_entry(name: &str, dataset: &str, scale: &PhysicalScale) -> Value {
    json!({
        "version": "0.4",
        "name": name,
        "axes": [
            { "name": "c", "type": "channel" },
            { "name": "z", "type": "space" },
            { "name": "y", "type": "space" },
            { "name": "x", "type": "space" },
        ],
        "datasets": [{
            "path": dataset,
            "coordinateTransformations": [{ "type": "scale", "scale": scale.czyx() }],
        }],
    })
}

fn chunk_key(c: usize, z: usize, ty: usize, tx: usize) -> String {
    format!("{c}.{z}.{ty}.{tx}")
}

fn write_json(path: &Path, value: &impl Serialize) -> SinkResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(SinkError::io(path))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> SinkResult<T> {
    let text = fs::read_to_string(path).map_err(SinkError::io(path))?;
    serde_json::from_str(&text).map_err(|source| SinkError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

/// A Zarr v2 group on disk.
#[derive(Debug, Clone)]
pub struct ZarrStore {
    root: PathBuf,
}

impl ZarrStore {
    /// Create the group directory (and `.zgroup`) if needed.
    pub fn create(root: impl Into<PathBuf>) -> SinkResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(SinkError::io(&root))?;
        let zgroup = root.join(ZGROUP);
        if !zgroup.exists() {
            write_json(&zgroup, &json!({ "zarr_format": 2 }))?;
        }
        Ok(Self { root })
    }

    pub fn open(root: impl Into<PathBuf>) -> SinkResult<Self> {
        let root = root.into();
        if !root.join(ZGROUP).is_file() {
            return Err(SinkError::message(format!(
                "Not a Zarr group: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_attrs(&self, attrs: &Value) -> SinkResult<()> {
        write_json(&self.root.join(ZATTRS), attrs)
    }

    /// Group attributes; an empty object when none were written.
    pub fn read_attrs(&self) -> SinkResult<Value> {
        let path = self.root.join(ZATTRS);
        if !path.exists() {
            return Ok(json!({}));
        }
        read_json(&path)
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.root.join(name).join(ZARRAY).is_file()
    }

    /// Start writing component `name`. Nothing is visible until
    /// [`ArrayWriter::commit`].
    pub fn create_array(&self, name: &str, shape: [usize; 4], pixel_type: PixelType) -> SinkResult<ArrayWriter> {
        ArrayWriter::create(&self.root, name, ArrayMeta::czyx(shape, pixel_type), pixel_type)
    }

    pub fn open_array(&self, name: &str) -> SinkResult<ZarrArray> {
        ZarrArray::open(self.root.join(name))
    }
}

/// Staged writer for one array component.
#[derive(Debug)]
pub struct ArrayWriter {
    staging: PathBuf,
    target: PathBuf,
    meta: ArrayMeta,
    pixel_type: PixelType,
    committed: bool,
}

impl ArrayWriter {
    fn create(root: &Path, name: &str, meta: ArrayMeta, pixel_type: PixelType) -> SinkResult<Self> {
        let target = root.join(name);
        let staging = root.join(format!(".{name}.partial"));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(SinkError::io(&staging))?;
        }
        fs::create_dir_all(&staging).map_err(SinkError::io(&staging))?;
        write_json(&staging.join(ZARRAY), &meta)?;
        debug!(component = name, staging = %staging.display(), "Staging array");
        Ok(Self {
            staging,
            target,
            meta,
            pixel_type,
            committed: false,
        })
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.meta.shape[0], self.meta.shape[1], self.meta.shape[2], self.meta.shape[3]]
    }

    /// Write plane `(c, z)` as one chunk file per spatial tile.
    pub fn write_plane<T: Element>(&self, c: usize, z: usize, plane: ArrayView2<T>) -> SinkResult<()> {
        if T::PIXEL_TYPE != self.pixel_type {
            return Err(SinkError::message(format!(
                "Plane element {:?} does not match array dtype {}",
                T::PIXEL_TYPE,
                self.meta.dtype
            )));
        }
        let [cs, zs, rows, cols] = self.shape();
        if c >= cs || z >= zs || plane.dim() != (rows, cols) {
            return Err(SinkError::message(format!(
                "Plane ({c}, {z}) with shape {:?} does not fit array {:?}",
                plane.dim(),
                self.meta.shape
            )));
        }

        let (tile_y, tile_x) = self.meta.tile();
        let mut bytes = Vec::with_capacity(tile_y * tile_x * self.pixel_type.byte_size());
        for ty in 0..rows.div_ceil(tile_y) {
            for tx in 0..cols.div_ceil(tile_x) {
                let y0 = ty * tile_y;
                let x0 = tx * tile_x;
                let y1 = (y0 + tile_y).min(rows);
                let x1 = (x0 + tile_x).min(cols);
                let block = plane.slice(s![y0..y1, x0..x1]);

                bytes.clear();
                for row in 0..tile_y {
                    for col in 0..tile_x {
                        let value = block.get((row, col)).copied().unwrap_or_else(T::zero);
                        value.write_le(&mut bytes);
                    }
                }
                let path = self.staging.join(chunk_key(c, z, ty, tx));
                fs::write(&path, &bytes).map_err(SinkError::io(&path))?;
            }
        }
        Ok(())
    }

    /// Write a computed plane, narrowing to the array's float precision.
    pub fn write_plane_f64(&self, c: usize, z: usize, plane: ArrayView2<f64>) -> SinkResult<()> {
        match self.pixel_type {
            PixelType::F64 => self.write_plane(c, z, plane),
            PixelType::F32 => self.write_plane(c, z, plane.mapv(|v| v as f32).view()),
            other => Err(SinkError::message(format!(
                "Computed planes cannot be stored as {other:?}"
            ))),
        }
    }

    /// Copy every plane of `volume` in its native element type.
    pub fn write_volume(&self, volume: &ImageVolume) -> SinkResult<()> {
        let [cs, zs, _, _] = volume.shape();
        for c in 0..cs {
            for z in 0..zs {
                match volume.data() {
                    VolumeData::U8(a) => self.write_plane(c, z, a.slice(s![c, z, .., ..]))?,
                    VolumeData::U16(a) => self.write_plane(c, z, a.slice(s![c, z, .., ..]))?,
                    VolumeData::U32(a) => self.write_plane(c, z, a.slice(s![c, z, .., ..]))?,
                    VolumeData::F32(a) => self.write_plane(c, z, a.slice(s![c, z, .., ..]))?,
                    VolumeData::F64(a) => self.write_plane(c, z, a.slice(s![c, z, .., ..]))?,
                }
            }
        }
        Ok(())
    }

    /// Replace any existing component with the staged one.
    pub fn commit(mut self) -> SinkResult<PathBuf> {
        if self.target.exists() {
            fs::remove_dir_all(&self.target).map_err(SinkError::io(&self.target))?;
        }
        fs::rename(&self.staging, &self.target).map_err(SinkError::io(&self.target))?;
        self.committed = true;
        debug!(component = %self.target.display(), "Committed array");
        Ok(self.target.clone())
    }
}

impl Drop for ArrayWriter {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            if let Err(err) = fs::remove_dir_all(&self.staging) {
                warn!(staging = %self.staging.display(), "Failed to remove staged array: {}", err);
            }
        }
    }
}

/// Read access to one committed CZYX array.
#[derive(Debug, Clone)]
pub struct ZarrArray {
    dir: PathBuf,
    meta: ArrayMeta,
    pixel_type: PixelType,
}

impl ZarrArray {
    pub fn open(dir: impl Into<PathBuf>) -> SinkResult<Self> {
        let dir = dir.into();
        let meta: ArrayMeta = read_json(&dir.join(ZARRAY))?;
        let invalid = |reason: &str| {
            SinkError::message(format!("Unsupported array {}: {}", dir.display(), reason))
        };
        if meta.zarr_format != 2 {
            return Err(invalid("zarr_format must be 2"));
        }
        if meta.shape.len() != 4 || meta.chunks.len() != 4 {
            return Err(invalid("expected 4 dimensions (c, z, y, x)"));
        }
        if meta.chunks[0] != 1 || meta.chunks[1] != 1 || meta.chunks[2] == 0 || meta.chunks[3] == 0 {
            return Err(invalid("chunks must be (1, 1, y, x)"));
        }
        if meta.compressor.is_some() || meta.order != "C" {
            return Err(invalid("only uncompressed C-order arrays are supported"));
        }
        let pixel_type = PixelType::from_zarr_dtype(&meta.dtype)
            .ok_or_else(|| invalid(&format!("dtype {}", meta.dtype)))?;
        Ok(Self {
            dir,
            meta,
            pixel_type,
        })
    }

    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    fn read_typed<T: Element>(&self, c: usize, z: usize) -> SinkResult<Array2<T>> {
        let [cs, zs, rows, cols] = PlaneSource::shape(self);
        if c >= cs || z >= zs {
            return Err(SinkError::message(format!(
                "Plane ({c}, {z}) outside array {:?}",
                self.meta.shape
            )));
        }
        let (tile_y, tile_x) = self.meta.tile();
        let width = T::PIXEL_TYPE.byte_size();
        let mut plane = Array2::from_elem((rows, cols), T::zero());

        for ty in 0..rows.div_ceil(tile_y) {
            for tx in 0..cols.div_ceil(tile_x) {
                let path = self.dir.join(chunk_key(c, z, ty, tx));
                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(SinkError::io(&path)(err)),
                };
                if bytes.len() != tile_y * tile_x * width {
                    return Err(SinkError::message(format!(
                        "Chunk {} has {} bytes, expected {}",
                        path.display(),
                        bytes.len(),
                        tile_y * tile_x * width
                    )));
                }
                let y0 = ty * tile_y;
                let x0 = tx * tile_x;
                for row in 0..tile_y.min(rows - y0) {
                    for col in 0..tile_x.min(cols - x0) {
                        let offset = (row * tile_x + col) * width;
                        plane[[y0 + row, x0 + col]] = T::read_le(&bytes[offset..offset + width]);
                    }
                }
            }
        }
        Ok(plane)
    }

    /// Plane `(c, z)` widened to `f64`.
    pub fn read_plane_f64(&self, c: usize, z: usize) -> SinkResult<Array2<f64>> {
        Ok(match self.pixel_type {
            PixelType::U8 => self.read_typed::<u8>(c, z)?.mapv(Element::to_f64),
            PixelType::U16 => self.read_typed::<u16>(c, z)?.mapv(Element::to_f64),
            PixelType::U32 => self.read_typed::<u32>(c, z)?.mapv(Element::to_f64),
            PixelType::F32 => self.read_typed::<f32>(c, z)?.mapv(Element::to_f64),
            PixelType::F64 => self.read_typed::<f64>(c, z)?,
        })
    }
}

impl PlaneSource for ZarrArray {
    fn shape(&self) -> [usize; 4] {
        [self.meta.shape[0], self.meta.shape[1], self.meta.shape[2], self.meta.shape[3]]
    }

    fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    fn read_plane(&self, c: usize, z: usize) -> Result<Array2<f64>, PreprocessError> {
        self.read_plane_f64(c, z).map_err(|err| PreprocessError::Source {
            c,
            z,
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use tempfile::TempDir;

    #[test]
    fn metadata_uses_capped_tiles() {
        let meta = ArrayMeta::czyx([2, 3, 300, 40], PixelType::U16);
        assert_eq!(meta.chunks, vec![1, 1, 256, 40]);
        assert_eq!(meta.dtype, "<u2");
        let text = serde_json::to_value(&meta).unwrap();
        assert_eq!(text["compressor"], Value::Null);
        assert_eq!(text["order"], "C");
    }

    #[test]
    fn plane_round_trip_across_partial_tiles() {
        let tmp = TempDir::new().unwrap();
        let store = ZarrStore::create(tmp.path().join("img.zarr")).unwrap();
        let plane = Array2::from_shape_fn((300, 270), |(y, x)| (y * 1000 + x) as u32);

        let writer = store.create_array("0", [1, 1, 300, 270], PixelType::U32).unwrap();
        writer.write_plane(0, 0, plane.view()).unwrap();
        writer.commit().unwrap();

        let array = store.open_array("0").unwrap();
        assert_eq!(PlaneSource::shape(&array), [1, 1, 300, 270]);
        assert_eq!(array.read_plane_f64(0, 0).unwrap(), plane.mapv(|v| v as f64));
        // four tiles: 256 + 44 rows by 256 + 14 columns
        assert!(tmp.path().join("img.zarr/0/0.0.1.1").is_file());
        assert!(!tmp.path().join("img.zarr/0/0.0.2.0").exists());
    }

    #[test]
    fn uncommitted_writer_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = ZarrStore::create(tmp.path().join("out.zarr")).unwrap();
        {
            let writer = store.create_array("corrected", [1, 1, 4, 4], PixelType::F32).unwrap();
            writer.write_plane_f64(0, 0, Array2::zeros((4, 4)).view()).unwrap();
        }
        assert!(!store.has_array("corrected"));
        assert!(!tmp.path().join("out.zarr/.corrected.partial").exists());
    }

    #[test]
    fn commit_replaces_previous_component() {
        let tmp = TempDir::new().unwrap();
        let store = ZarrStore::create(tmp.path().join("out.zarr")).unwrap();
        for value in [1.0f64, 2.0] {
            let writer = store.create_array("background", [1, 1, 2, 2], PixelType::F64).unwrap();
            writer.write_plane_f64(0, 0, Array2::from_elem((2, 2), value).view()).unwrap();
            writer.commit().unwrap();
        }
        let plane = store.open_array("background").unwrap().read_plane_f64(0, 0).unwrap();
        assert!(plane.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn rejects_mismatched_plane() {
        let tmp = TempDir::new().unwrap();
        let store = ZarrStore::create(tmp.path().join("out.zarr")).unwrap();
        let writer = store.create_array("0", [1, 1, 2, 2], PixelType::U16).unwrap();
        assert!(writer.write_plane(0, 0, Array2::<u8>::zeros((2, 2)).view()).is_err());
        assert!(writer.write_plane(0, 0, Array2::<u16>::zeros((3, 2)).view()).is_err());
        assert!(writer.write_plane(1, 0, Array2::<u16>::zeros((2, 2)).view()).is_err());
    }

    #[test]
    fn volume_copy_keeps_native_dtype() {
        let tmp = TempDir::new().unwrap();
        let store = ZarrStore::create(tmp.path().join("img.zarr")).unwrap();
        let volume = ImageVolume::from(Array4::from_shape_fn((2, 2, 3, 3), |(c, z, y, x)| {
            (c * 100 + z * 10 + y * 3 + x) as u16
        }));
        let writer = store.create_array("0", volume.shape(), volume.pixel_type()).unwrap();
        writer.write_volume(&volume).unwrap();
        writer.commit().unwrap();

        let array = store.open_array("0").unwrap();
        assert_eq!(PlaneSource::pixel_type(&array), PixelType::U16);
        assert_eq!(array.read_plane(1, 1).unwrap(), volume.read_plane(1, 1).unwrap());
    }

    #[test]
    fn attrs_default_to_empty_object() {
        let tmp = TempDir::new().unwrap();
        let store = ZarrStore::create(tmp.path().join("x.zarr")).unwrap();
        assert_eq!(store.read_attrs().unwrap(), json!({}));
        store.write_attrs(&json!({"method": "basic"})).unwrap();
        assert_eq!(ZarrStore::open(store.root()).unwrap().read_attrs().unwrap()["method"], "basic");
        assert!(ZarrStore::open(tmp.path().join("missing.zarr")).is_err());
    }
}
