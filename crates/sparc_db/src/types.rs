//! Entities persisted in the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sparc_protocol::{
    ChannelInfo, FileDigest, JobStatus, PhysicalScale, QcMetrics, TaskHandle, TaskKind,
};
use std::collections::BTreeMap;

/// Free-form JSON object.
pub type JsonObject = Map<String, Value>;

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Immutable provenance record of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub id: i64,
    pub project_id: i64,
    pub run_name: String,
    pub manifest_path: String,
    pub git_hash: Option<String>,
    pub dependencies: Vec<FileDigest>,
    pub inputs: Vec<FileDigest>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub run_name: String,
    pub manifest_path: String,
    pub git_hash: Option<String>,
    pub dependencies: Vec<FileDigest>,
    pub inputs: Vec<FileDigest>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRecord {
    pub id: i64,
    pub project_id: i64,
    pub snapshot_id: Option<i64>,
    pub source_path: String,
    pub panel_csv_path: Option<String>,
    pub convert_to_zarr: bool,
    pub zarr_path: Option<String>,
    pub channel_metadata: Option<Vec<ChannelInfo>>,
    pub scale_metadata: Option<PhysicalScale>,
    pub panel_mapping: Option<BTreeMap<String, String>>,
    pub request_metadata: JsonObject,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIngestRecord {
    pub source_path: String,
    pub panel_csv_path: Option<String>,
    pub convert_to_zarr: bool,
    pub request_metadata: JsonObject,
}

/// Fields written when an ingestion completes.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub zarr_path: Option<String>,
    pub channel_metadata: Vec<ChannelInfo>,
    pub scale_metadata: PhysicalScale,
    pub panel_mapping: Option<BTreeMap<String, String>>,
}

/// Result of a transactional ingestion submission.
#[derive(Debug, Clone)]
pub struct IngestSubmission {
    pub snapshot: RunSnapshot,
    pub record: IngestRecord,
    pub task: TaskHandle,
}

// ============================================================================
// Preprocessing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreprocessJob {
    pub id: i64,
    pub project_id: i64,
    pub ingest_record_id: i64,
    pub method: String,
    pub output_name: String,
    pub parameters: JsonObject,
    pub channels: Option<Vec<usize>>,
    pub progress: f64,
    pub status: JobStatus,
    pub result_path: Option<String>,
    pub qc_metrics: Option<QcMetrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPreprocessJob {
    pub project_id: i64,
    pub ingest_record_id: i64,
    pub method: String,
    pub output_name: String,
    pub parameters: JsonObject,
    pub channels: Option<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct PreprocessSubmission {
    pub job: PreprocessJob,
    pub task: TaskHandle,
}

// ============================================================================
// Task queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Claimed,
    Done,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "claimed" => Some(TaskState::Claimed),
            "done" => Some(TaskState::Done),
            _ => None,
        }
    }
}

/// A task row claimed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub id: String,
    pub kind: TaskKind,
    pub args: Value,
    pub state: TaskState,
    pub worker: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
}
