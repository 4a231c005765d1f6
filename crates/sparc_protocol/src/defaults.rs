//! Canonical default values shared by the service and the worker.

use std::time::Duration;

pub const DEFAULT_STATE_STORE_FILE: &str = "sparc.sqlite";
pub const DEFAULT_PROJECTS_DIR: &str = "projects";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Progress checkpoints written by the preprocessing handler.
pub const PROGRESS_PICKED_UP: f64 = 0.05;
pub const PROGRESS_QC_DONE: f64 = 0.5;
pub const PROGRESS_STORED: f64 = 0.9;
pub const PROGRESS_DONE: f64 = 1.0;

pub const UNEXPECTED_INGEST_FAILURE: &str = "Unexpected ingestion failure";
pub const UNEXPECTED_PREPROCESS_FAILURE: &str = "Unexpected preprocessing failure";

/// Edge length of spatial tiles in written array stores.
pub const STORE_TILE_EDGE: usize = 256;

/// Component names inside array stores.
pub const SOURCE_COMPONENT: &str = "0";
pub const BACKGROUND_COMPONENT: &str = "background";
pub const CORRECTED_COMPONENT: &str = "corrected";

/// Read buffer for streaming file hashes.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;
