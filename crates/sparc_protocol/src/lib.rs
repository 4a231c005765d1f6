//! Shared domain vocabulary for the Sparc imaging backend.
//!
//! Everything that crosses a crate boundary lives here: the job status state
//! machine, image metadata, the QC metric bundle, task names, and the
//! configuration struct handed to the service and the worker.

pub mod config;
pub mod defaults;
pub mod naming;
pub mod paths;
pub mod types;

pub use config::SparcConfig;
pub use naming::{is_valid_project_slug, sanitize_output_name, snapshot_slug};
pub use types::{
    ChannelInfo, ChannelSummary, FileDigest, ImageDims, InvalidTransition, JobStatus,
    PhysicalScale, QcMetrics, Stats, TaskHandle, TaskKind,
};
