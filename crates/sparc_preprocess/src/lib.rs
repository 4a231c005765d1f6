//! Background and illumination correction for CZYX microscopy volumes.
//!
//! - [`method`]: the closed registry of correction algorithms
//! - [`params`]: declared method parameters and request validation
//! - [`engine`]: per-plane task graph executed on a rayon pool, with
//!   streaming QC reductions
//! - [`volume`]: plane sources and pixel precision

mod adaptive;
mod border;
mod morphology;
mod polynomial;

pub mod engine;
pub mod error;
pub mod method;
pub mod params;
pub mod stats;
pub mod volume;

pub use engine::{
    build_pool, compute_background, BackgroundComputation, CorrectedPlane, CorrectionGraph,
    MemorySink, PlaneSink, PlaneTask,
};
pub use error::{PreprocessError, Result};
pub use method::{BackgroundMethod, LocalWeighting, MethodParams};
pub use params::{CatalogError, MethodCatalog, MethodSpec, ParameterError, ParameterSpec};
pub use stats::RunningStats;
pub use volume::{ImageVolume, PixelType, PlaneSource, Precision, VolumeData};
