//! Ingestion helpers: panel CSV mapping, metadata extraction and conversion
//! to a chunked imagery store.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use sparc_preprocess::{ImageVolume, PlaneSource};
use sparc_protocol::defaults::SOURCE_COMPONENT;
use sparc_protocol::{ChannelInfo, ImageDims, PhysicalScale};
use sparc_security::GuardError;
use sparc_sinks::{multiscale_entry, SinkError, ZarrStore};
use thiserror::Error;
use tracing::info;

use crate::reader::ImageReader;

const CHANNEL_COLUMNS: [&str; 3] = ["channel", "Channel", "Channel Name"];
const TARGET_COLUMNS: [&str; 3] = ["target", "Target", "Marker"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Panel CSV not found: {}", path.display())]
    PanelNotFound { path: PathBuf },

    #[error("Failed to parse panel CSV {}: {message}", path.display())]
    PanelInvalid { path: PathBuf, message: String },

    #[error("Unable to open image {}: {message}", path.display())]
    Unreadable { path: PathBuf, message: String },

    #[error("{0}")]
    Guard(#[from] GuardError),

    /// Writing the imagery store failed. Not a user-facing condition.
    #[error("Failed to write imagery store {}: {source}", path.display())]
    Store { path: PathBuf, source: SinkError },
}

impl IngestError {
    /// Whether the message is meant for the user. Store failures are
    /// reported generically.
    pub fn is_domain(&self) -> bool {
        !matches!(self, IngestError::Store { .. })
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Channel and scale metadata extracted from an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestMetadata {
    pub channels: Vec<ChannelInfo>,
    pub scale: PhysicalScale,
    pub scenes: Vec<String>,
    pub dims: ImageDims,
}

fn first_value<'a>(row: &'a BTreeMap<String, String>, columns: &[&str]) -> Option<&'a str> {
    columns
        .iter()
        .filter_map(|column| row.get(*column))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}

/// Load a `channel -> target` mapping from a panel CSV.
///
/// Rows missing either column are skipped. Later rows win.
pub fn load_panel_mapping(path: &Path) -> Result<BTreeMap<String, String>> {
    let bytes = fs::read(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => IngestError::PanelNotFound {
            path: path.to_path_buf(),
        },
        _ => IngestError::PanelInvalid {
            path: path.to_path_buf(),
            message: err.to_string(),
        },
    })?;
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes[..]);

    let invalid = |err: csv::Error| IngestError::PanelInvalid {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(body);
    let headers = reader.headers().map_err(invalid)?.clone();

    let mut mapping = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(invalid)?;
        let row: BTreeMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        if let (Some(channel), Some(target)) = (
            first_value(&row, &CHANNEL_COLUMNS),
            first_value(&row, &TARGET_COLUMNS),
        ) {
            mapping.insert(channel.trim().to_string(), target.trim().to_string());
        }
    }
    Ok(mapping)
}

fn unreadable(path: &Path, err: impl ToString) -> IngestError {
    IngestError::Unreadable {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Read channel names, pixel sizes, scenes and dims, applying the panel
/// mapping by channel name and then by index.
pub fn extract_metadata(
    reader: &dyn ImageReader,
    path: &Path,
    panel_mapping: &BTreeMap<String, String>,
) -> Result<IngestMetadata> {
    let metadata = reader
        .read_metadata(path)
        .map_err(|err| unreadable(path, err))?;

    let channels = metadata
        .channel_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let name = name.clone().unwrap_or_else(|| format!("C{index}"));
            let remapped_name = panel_mapping
                .get(&name)
                .or_else(|| panel_mapping.get(&index.to_string()))
                .filter(|target| !target.is_empty())
                .cloned();
            ChannelInfo {
                index,
                name,
                remapped_name,
            }
        })
        .collect();

    let sizes = metadata.physical_sizes;
    Ok(IngestMetadata {
        channels,
        scale: PhysicalScale {
            x: sizes.x.unwrap_or(1.0),
            y: sizes.y.unwrap_or(1.0),
            z: sizes.z.unwrap_or(1.0),
        },
        scenes: metadata.scenes,
        dims: metadata.dims,
    })
}

/// Imagery store location for a source image: `<imagery>/<stem>.zarr`.
pub fn store_path(imagery_dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    imagery_dir.join(format!("{stem}.zarr"))
}

/// Write the first timepoint as component `0` of a single-resolution store,
/// replacing any previous store at `output`.
pub fn convert_to_store(
    reader: &dyn ImageReader,
    source: &Path,
    output: &Path,
    channels: &[ChannelInfo],
    scale: &PhysicalScale,
) -> Result<PathBuf> {
    let volume = reader
        .read_volume(source)
        .map_err(|err| unreadable(source, err))?;
    write_store(&volume, output, channels, scale).map_err(|source| IngestError::Store {
        path: output.to_path_buf(),
        source,
    })
}

fn write_store(
    volume: &ImageVolume,
    output: &Path,
    channels: &[ChannelInfo],
    scale: &PhysicalScale,
) -> std::result::Result<PathBuf, SinkError> {
    if output.exists() {
        fs::remove_dir_all(output).map_err(|source| SinkError::Io {
            path: output.to_path_buf(),
            source,
        })?;
    }
    let store = ZarrStore::create(output)?;
    let shape = volume.shape();
    let array = store.create_array(SOURCE_COMPONENT, shape, volume.pixel_type())?;
    array.write_volume(volume)?;
    array.commit()?;

    let name = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let labels: Vec<_> = channels
        .iter()
        .map(|channel| json!({ "label": channel.label() }))
        .collect();
    store.write_attrs(&json!({
        "multiscales": [multiscale_entry(&name, SOURCE_COMPONENT, scale)],
        "omero": { "channels": labels },
    }))?;

    info!(path = %output.display(), shape = ?shape, "Imagery store written");
    Ok(output.to_path_buf())
}
