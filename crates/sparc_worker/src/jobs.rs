//! Job handlers
//!
//! Each handler drives one job through `queued -> running -> completed|failed`:
//! - pickup is committed before any heavy work
//! - heavy work runs on the blocking pool; a panic there is an unexpected failure
//! - domain failures persist their message, unexpected failures persist a
//!   generic message and only log the cause
//! - a job already in a terminal state is left untouched
//!
//! Handlers only return `Err` when the state store itself is unreachable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rayon::ThreadPool;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sparc_db::{DbError, IngestOutcome, IngestRecord, PreprocessJob, Project, QueuedTask, SparcDb};
use sparc_preprocess::{
    build_pool, BackgroundMethod, CorrectionGraph, MethodParams, PlaneSource, PreprocessError,
};
use sparc_protocol::defaults::{
    PROGRESS_PICKED_UP, PROGRESS_QC_DONE, PROGRESS_STORED, SOURCE_COMPONENT,
    UNEXPECTED_INGEST_FAILURE, UNEXPECTED_PREPROCESS_FAILURE,
};
use sparc_protocol::{QcMetrics, SparcConfig, TaskKind};
use sparc_security::{GuardError, ProjectManager};
use sparc_sinks::{
    annotation_path, AnnotationStore, CorrectionSummary, ResultMetadata, ResultStoreWriter,
    SinkError, ZarrStore,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ingest::{self, IngestError};
use crate::reader::{ImageReader, OmeTiffReader};

// ============================================================================
// Errors
// ============================================================================

/// Failure of a job after pickup. Decides the persisted message.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Reported to the user verbatim.
    #[error("{0}")]
    Domain(String),

    /// Logged; the user sees a generic message.
    #[error("{0}")]
    Unexpected(String),
}

impl WorkerError {
    fn unexpected(err: impl std::fmt::Display) -> Self {
        WorkerError::Unexpected(format!("{err:#}"))
    }

    /// Message persisted on the job row.
    fn persisted_message(&self, generic: &str) -> String {
        match self {
            WorkerError::Domain(message) => message.clone(),
            WorkerError::Unexpected(_) => generic.to_string(),
        }
    }
}

impl From<IngestError> for WorkerError {
    fn from(err: IngestError) -> Self {
        if err.is_domain() {
            WorkerError::Domain(err.to_string())
        } else {
            WorkerError::unexpected(err)
        }
    }
}

impl From<GuardError> for WorkerError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Io(_) => WorkerError::unexpected(err),
            other => WorkerError::Domain(other.to_string()),
        }
    }
}

impl From<PreprocessError> for WorkerError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::UnknownMethod(_)
            | PreprocessError::EmptyChannelSelection
            | PreprocessError::ChannelOutOfRange { .. } => WorkerError::Domain(err.to_string()),
            other => WorkerError::unexpected(other),
        }
    }
}

impl From<SinkError> for WorkerError {
    fn from(err: SinkError) -> Self {
        WorkerError::unexpected(err)
    }
}

impl From<DbError> for WorkerError {
    fn from(err: DbError) -> Self {
        WorkerError::unexpected(err)
    }
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            WorkerError::Unexpected("compute step panicked".to_string())
        } else {
            WorkerError::unexpected(err)
        }
    }
}

type JobResult<T> = std::result::Result<T, WorkerError>;

// ============================================================================
// Context
// ============================================================================

/// Everything a handler needs, built once per worker process.
pub struct JobContext {
    pub db: SparcDb,
    pub projects: ProjectManager,
    pub reader: Arc<dyn ImageReader>,
    pub pool: Arc<ThreadPool>,
}

impl JobContext {
    pub fn new(
        db: SparcDb,
        projects: ProjectManager,
        reader: Arc<dyn ImageReader>,
        pool: ThreadPool,
    ) -> Self {
        Self {
            db,
            projects,
            reader,
            pool: Arc::new(pool),
        }
    }

    /// Open the state store and project base named by `config`.
    pub async fn from_config(config: &SparcConfig) -> anyhow::Result<Self> {
        let db = SparcDb::open(&config.state_store_path).await?;
        let projects = ProjectManager::new(&config.projects_root)?;
        let pool = build_pool(config.worker_threads)?;
        Ok(Self::new(db, projects, Arc::new(OmeTiffReader), pool))
    }

    async fn project(&self, project_id: i64) -> JobResult<Project> {
        self.db
            .get_project_by_id(project_id)
            .await?
            .ok_or_else(|| WorkerError::Domain(format!("Project {project_id} not found")))
    }
}

// ============================================================================
// Summaries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Completed,
    Failed,
    /// The referenced entity does not exist.
    Missing,
    /// The entity was already terminal.
    Skipped,
}

/// What a handler did with one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task: TaskKind,
    pub id: Option<i64>,
    pub status: SummaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub detail: Map<String, Value>,
}

impl TaskSummary {
    fn new(task: TaskKind, id: Option<i64>, status: SummaryStatus) -> Self {
        Self {
            task,
            id,
            status,
            error_message: None,
            detail: Map::new(),
        }
    }

    fn failed(task: TaskKind, id: i64, message: String) -> Self {
        Self {
            error_message: Some(message),
            ..Self::new(task, Some(id), SummaryStatus::Failed)
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run the handler for a claimed task.
pub async fn dispatch(ctx: &JobContext, task: &QueuedTask) -> Result<TaskSummary, DbError> {
    let key = match task.kind {
        TaskKind::IngestImage => "ingest_record_id",
        TaskKind::BackgroundPreprocess => "job_id",
    };
    let Some(id) = task.args.get(key).and_then(Value::as_i64) else {
        warn!(task_id = %task.id, task = %task.kind, args = %task.args, "Task arguments missing '{}'", key);
        return Ok(TaskSummary::new(task.kind, None, SummaryStatus::Missing));
    };
    match task.kind {
        TaskKind::IngestImage => run_ingest(ctx, id).await,
        TaskKind::BackgroundPreprocess => run_preprocess(ctx, id).await,
    }
}

// ============================================================================
// Ingestion
// ============================================================================

struct IngestProduct {
    outcome: IngestOutcome,
    channel_count: usize,
    dims: Value,
    scenes: Vec<String>,
}

pub async fn run_ingest(ctx: &JobContext, record_id: i64) -> Result<TaskSummary, DbError> {
    let kind = TaskKind::IngestImage;
    let Some(record) = ctx.db.get_ingest_record(record_id).await? else {
        error!(ingest_record_id = record_id, "Ingest record not found");
        return Ok(TaskSummary::new(kind, Some(record_id), SummaryStatus::Missing));
    };
    if record.status.is_terminal() {
        info!(ingest_record_id = record_id, status = %record.status, "Ingest record already finished, skipping");
        return Ok(TaskSummary::new(kind, Some(record_id), SummaryStatus::Skipped));
    }

    let record = ctx.db.mark_ingest_running(record_id).await?;
    info!(ingest_record_id = record_id, source = %record.source_path, "Ingestion started");

    match ingest_record(ctx, &record).await {
        Ok(product) => {
            let record = ctx.db.complete_ingest(record_id, &product.outcome).await?;
            info!(
                ingest_record_id = record_id,
                channels = product.channel_count,
                zarr_path = record.zarr_path.as_deref().unwrap_or("-"),
                "Ingestion completed"
            );
            Ok(TaskSummary::new(kind, Some(record_id), SummaryStatus::Completed)
                .with("channel_count", json!(product.channel_count))
                .with("panel_mapping", json!(record.panel_mapping))
                .with("zarr_path", json!(record.zarr_path))
                .with("dims", product.dims)
                .with("scenes", json!(product.scenes)))
        }
        Err(err) => {
            match &err {
                WorkerError::Domain(message) => {
                    warn!(ingest_record_id = record_id, error = %message, "Ingestion failed")
                }
                WorkerError::Unexpected(detail) => {
                    error!(ingest_record_id = record_id, error = %detail, "Unexpected failure during ingestion")
                }
            }
            let message = err.persisted_message(UNEXPECTED_INGEST_FAILURE);
            ctx.db.fail_ingest(record_id, &message).await?;
            Ok(TaskSummary::failed(kind, record_id, message))
        }
    }
}

async fn ingest_record(ctx: &JobContext, record: &IngestRecord) -> JobResult<IngestProduct> {
    let project = ctx.project(record.project_id).await?;
    let layout = ctx.projects.layout(&project.slug)?;

    let source = ctx
        .projects
        .resolve(&project.slug, Path::new(&record.source_path))
        .map_err(IngestError::from)?;
    let panel = match &record.panel_csv_path {
        Some(panel) => Some(
            ctx.projects
                .resolve(&project.slug, Path::new(panel))
                .map_err(IngestError::from)?,
        ),
        None => None,
    };

    let reader = Arc::clone(&ctx.reader);
    let convert = record.convert_to_zarr;
    let imagery = layout.imagery();
    let (panel_mapping, metadata, zarr_path) = tokio::task::spawn_blocking(
        move || -> Result<_, IngestError> {
            let panel_mapping = match &panel {
                Some(panel) => ingest::load_panel_mapping(panel)?,
                None => BTreeMap::new(),
            };
            let metadata = ingest::extract_metadata(reader.as_ref(), &source, &panel_mapping)?;
            let zarr_path = if convert {
                let output = ingest::store_path(&imagery, &source);
                Some(ingest::convert_to_store(
                    reader.as_ref(),
                    &source,
                    &output,
                    &metadata.channels,
                    &metadata.scale,
                )?)
            } else {
                None
            };
            Ok((panel_mapping, metadata, zarr_path))
        },
    )
    .await??;

    Ok(IngestProduct {
        channel_count: metadata.channels.len(),
        dims: json!(metadata.dims),
        scenes: metadata.scenes,
        outcome: IngestOutcome {
            zarr_path: zarr_path.map(|p| p.display().to_string()),
            channel_metadata: metadata.channels,
            scale_metadata: metadata.scale,
            panel_mapping: (!panel_mapping.is_empty()).then_some(panel_mapping),
        },
    })
}

// ============================================================================
// Preprocessing
// ============================================================================

pub async fn run_preprocess(ctx: &JobContext, job_id: i64) -> Result<TaskSummary, DbError> {
    let kind = TaskKind::BackgroundPreprocess;
    let Some(job) = ctx.db.get_preprocess_job(job_id).await? else {
        error!(job_id, "Preprocess job not found");
        return Ok(TaskSummary::new(kind, Some(job_id), SummaryStatus::Missing));
    };
    if job.status.is_terminal() {
        info!(job_id, status = %job.status, "Preprocess job already finished, skipping");
        return Ok(TaskSummary::new(kind, Some(job_id), SummaryStatus::Skipped));
    }

    let job = ctx.db.mark_preprocess_running(job_id, PROGRESS_PICKED_UP).await?;
    info!(job_id, method = %job.method, output = %job.output_name, "Preprocessing started");

    match preprocess_job(ctx, &job).await {
        Ok((result_path, qc_metrics)) => {
            ctx.db
                .complete_preprocess(job_id, &result_path, &qc_metrics)
                .await?;
            info!(job_id, result_path = %result_path, "Preprocessing completed");
            Ok(TaskSummary::new(kind, Some(job_id), SummaryStatus::Completed)
                .with("result_path", json!(result_path))
                .with("channel_count", json!(qc_metrics.per_channel.len())))
        }
        Err(err) => {
            match &err {
                WorkerError::Domain(message) => {
                    warn!(job_id, error = %message, "Preprocessing failed")
                }
                WorkerError::Unexpected(detail) => {
                    error!(job_id, error = %detail, "Unexpected failure during preprocessing")
                }
            }
            let message = err.persisted_message(UNEXPECTED_PREPROCESS_FAILURE);
            ctx.db.fail_preprocess(job_id, &message).await?;
            Ok(TaskSummary::failed(kind, job_id, message))
        }
    }
}

/// Pixel source for a preprocessing run: component `0` of the imagery store
/// when one exists, otherwise the source image.
fn open_source(
    reader: &dyn ImageReader,
    zarr_path: Option<&Path>,
    source: &Path,
) -> JobResult<Box<dyn PlaneSource>> {
    if let Some(zarr_path) = zarr_path {
        if let Ok(store) = ZarrStore::open(zarr_path) {
            if store.has_array(SOURCE_COMPONENT) {
                return Ok(Box::new(store.open_array(SOURCE_COMPONENT)?));
            }
        }
        warn!(zarr_path = %zarr_path.display(), "Imagery store unavailable, reading source image");
    }
    let volume = reader.read_volume(source).map_err(|err| IngestError::Unreadable {
        path: source.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(Box::new(volume))
}

async fn preprocess_job(ctx: &JobContext, job: &PreprocessJob) -> JobResult<(String, QcMetrics)> {
    let record = ctx
        .db
        .get_ingest_record(job.ingest_record_id)
        .await?
        .ok_or_else(|| {
            WorkerError::Domain(format!("Ingest record {} not found", job.ingest_record_id))
        })?;
    let project = ctx.project(job.project_id).await?;
    let layout = ctx.projects.layout(&project.slug)?;

    let method = BackgroundMethod::from_str(&job.method)?;
    let params = MethodParams::from_values(method, &job.parameters);
    let source = ctx
        .projects
        .resolve(&project.slug, Path::new(&record.source_path))?;
    let zarr_path = match &record.zarr_path {
        Some(path) => Some(ctx.projects.resolve(&project.slug, Path::new(path))?),
        None => None,
    };
    let output = ctx.projects.resolve(
        &project.slug,
        &layout.imagery().join(format!("{}.zarr", job.output_name)),
    )?;

    // Phase 1: per-plane computation streamed into the result store.
    let reader = Arc::clone(&ctx.reader);
    let pool = Arc::clone(&ctx.pool);
    let channels = job.channels.clone();
    let (writer, qc_metrics, selected) = tokio::task::spawn_blocking(move || -> JobResult<_> {
        let input = open_source(reader.as_ref(), zarr_path.as_deref(), &source)?;
        let graph = CorrectionGraph::new(input.as_ref(), params, channels.as_deref())?;
        let writer = ResultStoreWriter::create(&output, graph.output_shape(), graph.precision())?;
        let qc_metrics = graph.execute(&pool, &writer)?;
        Ok((writer, qc_metrics, graph.channels().to_vec()))
    })
    .await??;
    ctx.db.update_preprocess_progress(job.id, PROGRESS_QC_DONE).await?;

    // Phase 2: commit components and attributes.
    let metadata = ResultMetadata {
        name: job.output_name.clone(),
        method: method.as_str().to_string(),
        parameters: job.parameters.clone(),
        channels: selected.clone(),
        scale: record.scale_metadata.unwrap_or_default(),
    };
    let result_path: PathBuf =
        tokio::task::spawn_blocking(move || writer.finish(&metadata)).await??;
    ctx.db.update_preprocess_progress(job.id, PROGRESS_STORED).await?;

    // Phase 3: summary next to the image.
    let stem = Path::new(&record.source_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("ingest-{}", record.id));
    let annotations = AnnotationStore::open(annotation_path(&layout.h5ad(), &stem)).await?;
    let result_path = result_path.display().to_string();
    annotations
        .record(&CorrectionSummary {
            output_name: job.output_name.clone(),
            method: method.as_str().to_string(),
            parameters: job.parameters.clone(),
            channels: selected,
            qc_metrics: qc_metrics.clone(),
            result_path: result_path.clone(),
            updated_at: chrono::Utc::now(),
        })
        .await?;
    annotations.close().await;

    Ok((result_path, qc_metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_messages_are_persisted_verbatim() {
        let err = WorkerError::from(PreprocessError::UnknownMethod("fft".to_string()));
        assert_eq!(
            err.persisted_message(UNEXPECTED_PREPROCESS_FAILURE),
            "Unsupported background method 'fft'"
        );

        let err = WorkerError::from(IngestError::PanelNotFound {
            path: PathBuf::from("/p/panel.csv"),
        });
        assert_eq!(
            err.persisted_message(UNEXPECTED_INGEST_FAILURE),
            "Panel CSV not found: /p/panel.csv"
        );
    }

    #[test]
    fn unexpected_causes_are_not_persisted() {
        let err = WorkerError::from(PreprocessError::Sink {
            c: 0,
            z: 1,
            message: "disk full".to_string(),
        });
        assert!(matches!(err, WorkerError::Unexpected(ref detail) if detail.contains("disk full")));
        assert_eq!(
            err.persisted_message(UNEXPECTED_PREPROCESS_FAILURE),
            UNEXPECTED_PREPROCESS_FAILURE
        );
    }

    #[test]
    fn guard_escapes_are_domain_failures() {
        let err = WorkerError::from(GuardError::PathEscape {
            path: "../x".to_string(),
            root: "/p".to_string(),
        });
        assert!(matches!(err, WorkerError::Domain(_)));
    }

    #[test]
    fn summary_serializes_without_empty_fields() {
        let summary = TaskSummary::new(TaskKind::IngestImage, Some(4), SummaryStatus::Missing);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value, json!({"task": "sparc.ingest_image", "id": 4, "status": "missing"}));
    }
}
