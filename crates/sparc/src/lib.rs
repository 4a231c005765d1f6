//! Sparc - Core Library
//!
//! Request validation, run snapshots and the submission API shared by the
//! `sparc` binary and integration tests.

pub mod error;
pub mod service;
pub mod snapshots;

pub use error::{Result, ServiceError, ValidationError};
pub use service::{
    load_run_config, BackgroundRequest, BackgroundSubmitted, IngestRequest, IngestSubmitted,
    LayoutView, ProjectView, RunRequest, RunSubmitted, SparcService,
};
pub use snapshots::{SnapshotManager, SnapshotRecord};
