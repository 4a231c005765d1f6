//! Sparc worker
//!
//! Claims tasks from the durable queue and runs them:
//! - `sparc.ingest_image`: panel mapping, metadata extraction, optional
//!   conversion of the source image into an imagery store
//! - `sparc.background_preprocess`: background correction streamed into a
//!   result store, plus a summary in the image's annotation store

pub mod ingest;
pub mod jobs;
pub mod reader;
pub mod worker;

pub use ingest::{IngestError, IngestMetadata};
pub use jobs::{dispatch, run_ingest, run_preprocess, JobContext, SummaryStatus, TaskSummary, WorkerError};
pub use reader::{ImageMetadata, ImageReader, OmeTiffReader, PhysicalSizes, ReaderError};
pub use worker::{process_next, Worker, WorkerConfig, WorkerHandle};
