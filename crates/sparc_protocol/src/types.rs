//! Canonical domain types shared by the store, the worker and the service.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Job lifecycle
// ============================================================================

/// Lifecycle of an ingestion record or preprocessing job.
///
/// The only legal path is `queued -> running -> {completed | failed}`.
/// A job never re-enters `queued`; `running -> running` is allowed so that
/// an at-least-once redelivery after a worker crash can restart the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

/// Rejected status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// States a row may be in for `next` to be written over it.
    pub fn predecessors(next: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub fn transition(self, next: JobStatus) -> Result<JobStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

// ============================================================================
// Task queue
// ============================================================================

/// Kinds of work dispatched through the durable task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "sparc.ingest_image")]
    IngestImage,
    #[serde(rename = "sparc.background_preprocess")]
    BackgroundPreprocess,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IngestImage => "sparc.ingest_image",
            TaskKind::BackgroundPreprocess => "sparc.background_preprocess",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sparc.ingest_image" => Ok(TaskKind::IngestImage),
            "sparc.background_preprocess" => Ok(TaskKind::BackgroundPreprocess),
            _ => Err(format!("Unknown task: '{}'", s)),
        }
    }
}

/// Handle returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
    pub task: TaskKind,
}

// ============================================================================
// Image metadata
// ============================================================================

/// One channel of an ingested image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: usize,
    pub name: String,
    pub remapped_name: Option<String>,
}

impl ChannelInfo {
    /// Label shown to users: the panel target when remapped, else the raw name.
    pub fn label(&self) -> &str {
        self.remapped_name.as_deref().unwrap_or(&self.name)
    }
}

/// Physical pixel size per spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalScale {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for PhysicalScale {
    fn default() -> Self {
        Self {
            x: 1.0,
            y: 1.0,
            z: 1.0,
        }
    }
}

impl PhysicalScale {
    /// Scale vector for a `c, z, y, x` array.
    pub fn czyx(&self) -> [f64; 4] {
        [1.0, self.z, self.y, self.x]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub c: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl ImageDims {
    pub fn shape(&self) -> [usize; 4] {
        [self.c, self.z, self.y, self.x]
    }
}

// ============================================================================
// QC metrics
// ============================================================================

/// Summary statistics of an array.
///
/// Non-finite values serialize as JSON `null` and read back as NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(deserialize_with = "nan_if_null")]
    pub mean: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub std: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub min: f64,
    #[serde(deserialize_with = "nan_if_null")]
    pub max: f64,
}

fn nan_if_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_index: usize,
    #[serde(flatten)]
    pub stats: Stats,
}

/// QC bundle attached to a completed preprocessing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcMetrics {
    pub raw: Stats,
    pub background: Stats,
    pub corrected: Stats,
    pub per_channel: Vec<ChannelSummary>,
}

// ============================================================================
// Provenance
// ============================================================================

/// A hashed file reference inside a run snapshot.
///
/// `sha256` is empty when the file did not exist at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: String,
    pub sha256: String,
}
