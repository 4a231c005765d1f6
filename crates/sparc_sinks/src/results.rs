//! Background correction result stores.
//!
//! One store per output holds two components, `background` and
//! `corrected`, each committed on its own. Group attributes carry the
//! multiscale description plus the method, parameters and channels used.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use sparc_preprocess::{CorrectedPlane, PlaneSink, PlaneTask, Precision, PreprocessError};
use sparc_protocol::defaults::{BACKGROUND_COMPONENT, CORRECTED_COMPONENT};
use sparc_protocol::PhysicalScale;
use tracing::info;

use crate::error::SinkResult;
use crate::zarr::{multiscale_entry, ArrayWriter, ZarrStore};

/// Provenance written into the result store's attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMetadata {
    pub name: String,
    pub method: String,
    pub parameters: Map<String, Value>,
    pub channels: Vec<usize>,
    pub scale: PhysicalScale,
}

impl ResultMetadata {
    fn attrs(&self) -> Value {
        // Each component is its own single-level image.
        let multiscales: Vec<Value> = [CORRECTED_COMPONENT, BACKGROUND_COMPONENT]
            .iter()
            .map(|component| {
                multiscale_entry(&format!("{}/{component}", self.name), component, &self.scale)
            })
            .collect();
        json!({
            "multiscales": multiscales,
            "method": self.method,
            "parameters": self.parameters,
            "channels": self.channels,
        })
    }
}

/// Streams corrected planes into a result store.
pub struct ResultStoreWriter {
    store: ZarrStore,
    background: ArrayWriter,
    corrected: ArrayWriter,
}

impl ResultStoreWriter {
    pub fn create(path: impl Into<PathBuf>, shape: [usize; 4], precision: Precision) -> SinkResult<Self> {
        let store = ZarrStore::create(path)?;
        let pixel_type = precision.pixel_type();
        let background = store.create_array(BACKGROUND_COMPONENT, shape, pixel_type)?;
        let corrected = store.create_array(CORRECTED_COMPONENT, shape, pixel_type)?;
        Ok(Self {
            store,
            background,
            corrected,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.root()
    }

    /// Commit both components and write attributes.
    pub fn finish(self, metadata: &ResultMetadata) -> SinkResult<PathBuf> {
        let Self {
            store,
            background,
            corrected,
        } = self;
        background.commit()?;
        corrected.commit()?;
        store.write_attrs(&metadata.attrs())?;
        info!(
            path = %store.root().display(),
            method = %metadata.method,
            channels = metadata.channels.len(),
            "Result store written"
        );
        Ok(store.root().to_path_buf())
    }
}

impl PlaneSink for ResultStoreWriter {
    fn write_plane(&self, task: &PlaneTask, plane: &CorrectedPlane) -> Result<(), PreprocessError> {
        self.background
            .write_plane_f64(task.channel, task.z, plane.background.view())
            .and_then(|_| {
                self.corrected
                    .write_plane_f64(task.channel, task.z, plane.corrected.view())
            })
            .map_err(|err| PreprocessError::Sink {
                c: task.channel,
                z: task.z,
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use sparc_preprocess::{build_pool, BackgroundMethod, CorrectionGraph, ImageVolume, MethodParams};
    use tempfile::TempDir;

    #[test]
    fn streams_graph_into_store() {
        let tmp = TempDir::new().unwrap();
        let volume = ImageVolume::from(Array4::from_shape_fn((3, 2, 10, 12), |(c, z, y, x)| {
            (c * 40 + z * 5 + (x + y) % 4) as u16
        }));
        let params = MethodParams::defaults(BackgroundMethod::Morphological);
        let graph = CorrectionGraph::new(&volume, params, Some(&[2])).unwrap();
        let writer =
            ResultStoreWriter::create(tmp.path().join("out.zarr"), graph.output_shape(), graph.precision()).unwrap();

        let pool = build_pool(Some(2)).unwrap();
        let qc = graph.execute(&pool, &writer).unwrap();
        let path = writer
            .finish(&ResultMetadata {
                name: "out".to_string(),
                method: "morphological".to_string(),
                parameters: params.to_values(),
                channels: vec![2],
                scale: PhysicalScale::default(),
            })
            .unwrap();

        let store = ZarrStore::open(&path).unwrap();
        assert!(store.has_array(BACKGROUND_COMPONENT));
        assert!(store.has_array(CORRECTED_COMPONENT));

        let corrected = store.open_array(CORRECTED_COMPONENT).unwrap();
        assert_eq!(corrected.meta().shape, vec![1, 2, 10, 12]);
        assert_eq!(corrected.meta().dtype, "<f4");
        let plane = corrected.read_plane_f64(0, 1).unwrap();
        assert!(plane.iter().all(|&v| v >= 0.0));
        assert!(qc.per_channel[0].stats.max >= plane.iter().cloned().fold(f64::MIN, f64::max));

        let attrs = store.read_attrs().unwrap();
        assert_eq!(attrs["method"], "morphological");
        assert_eq!(attrs["channels"], json!([2]));
        assert_eq!(attrs["parameters"]["opening_radius"], 15);
        assert_eq!(attrs["multiscales"][0]["axes"][0]["name"], "c");
        assert_eq!(
            attrs["multiscales"][0]["datasets"][0]["coordinateTransformations"][0]["scale"],
            json!([1.0, 1.0, 1.0, 1.0])
        );
        for entry in attrs["multiscales"].as_array().unwrap() {
            assert_eq!(entry["datasets"].as_array().unwrap().len(), 1);
        }
    }

    #[test]
    fn each_component_is_a_single_level_image() {
        let metadata = ResultMetadata {
            name: "slide".to_string(),
            method: "basic".to_string(),
            parameters: Map::new(),
            channels: vec![0, 1],
            scale: PhysicalScale::default(),
        };
        let attrs = metadata.attrs();
        let multiscales = attrs["multiscales"].as_array().unwrap();
        assert_eq!(multiscales.len(), 2);
        for (entry, component) in multiscales.iter().zip([CORRECTED_COMPONENT, BACKGROUND_COMPONENT]) {
            assert_eq!(entry["name"], format!("slide/{component}"));
            let datasets = entry["datasets"].as_array().unwrap();
            assert_eq!(datasets.len(), 1);
            assert_eq!(datasets[0]["path"], component);
        }
    }

    #[test]
    fn abandoned_writer_leaves_no_components() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.zarr");
        {
            let _writer = ResultStoreWriter::create(&path, [1, 1, 4, 4], Precision::F32).unwrap();
        }
        let store = ZarrStore::open(&path).unwrap();
        assert!(!store.has_array(BACKGROUND_COMPONENT));
        assert!(!store.has_array(CORRECTED_COMPONENT));
    }
}
