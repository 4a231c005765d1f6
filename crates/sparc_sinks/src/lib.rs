//! Output writers for Sparc.
//!
//! - [`zarr`]: Zarr v2 directory stores (uncompressed, dot-separated chunk
//!   keys) with a staged, rename-on-commit array writer and a lazy plane reader
//! - [`results`]: the background/corrected result store
//! - [`annotations`]: per-image table of correction summaries keyed by output name

pub mod annotations;
mod error;
pub mod results;
pub mod zarr;

pub use annotations::{annotation_path, AnnotationStore, CorrectionSummary};
pub use error::{SinkError, SinkResult};
pub use results::{ResultMetadata, ResultStoreWriter};
pub use zarr::{multiscale_entry, ArrayMeta, ArrayWriter, Element, ZarrArray, ZarrStore};
