//! Submission and status API
//!
//! Every request is validated (project, paths, parameters, output name)
//! before anything is written. Accepted requests are persisted together
//! with their queue task in one transaction; workers pick them up from the
//! same store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sparc_db::{IngestRecord, NewIngestRecord, NewPreprocessJob, PreprocessJob, Project, RunSnapshot, SparcDb};
use sparc_preprocess::{MethodCatalog, MethodSpec};
use sparc_protocol::{sanitize_output_name, JobStatus, SparcConfig};
use sparc_security::{ProjectLayout, ProjectManager};
use tracing::info;

use crate::error::{Result, ServiceError, ValidationError};
use crate::snapshots::SnapshotManager;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub project_slug: String,
    pub run_name: String,
    pub image_path: PathBuf,
    #[serde(default)]
    pub convert_to_zarr: bool,
    #[serde(default)]
    pub panel_csv_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundRequest {
    pub project_slug: String,
    pub ingest_record_id: i64,
    pub method: String,
    pub output_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub channels: Option<Vec<i64>>,
}

/// Either submission, as read from a run configuration file.
#[derive(Debug, Clone, PartialEq)]
pub enum RunRequest {
    Ingest(IngestRequest),
    Background(BackgroundRequest),
}

impl RunRequest {
    /// Interpret a payload mapping. Payloads naming an `ingest_record_id`
    /// are preprocessing requests; everything else is an ingestion.
    pub fn from_payload(payload: Map<String, Value>) -> std::result::Result<Self, ValidationError> {
        let invalid = |err: serde_json::Error| ValidationError::Payload(err.to_string());
        if payload.contains_key("ingest_record_id") {
            serde_json::from_value(Value::Object(payload))
                .map(RunRequest::Background)
                .map_err(invalid)
        } else {
            serde_json::from_value(Value::Object(payload))
                .map(RunRequest::Ingest)
                .map_err(invalid)
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutView {
    pub root: String,
    pub imagery: String,
    pub masks: String,
    pub h5ad: String,
    pub spatialdata: String,
    pub configs: String,
    pub logs: String,
    pub snapshots: String,
}

impl From<&ProjectLayout> for LayoutView {
    fn from(layout: &ProjectLayout) -> Self {
        let show = |p: PathBuf| p.display().to_string();
        Self {
            root: show(layout.root.clone()),
            imagery: show(layout.imagery()),
            masks: show(layout.masks()),
            h5ad: show(layout.h5ad()),
            spatialdata: show(layout.spatialdata()),
            configs: show(layout.configs()),
            logs: show(layout.logs()),
            snapshots: show(layout.snapshots()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectView {
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
    pub layout: LayoutView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSubmitted {
    pub task_id: String,
    pub ingest_record_id: i64,
    pub project: ProjectView,
    pub snapshot: RunSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackgroundSubmitted {
    pub task_id: String,
    pub job_id: i64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunSubmitted {
    Ingest(IngestSubmitted),
    Background(BackgroundSubmitted),
}

// ============================================================================
// Service
// ============================================================================

pub struct SparcService {
    db: SparcDb,
    projects: ProjectManager,
    snapshots: SnapshotManager,
    catalog: MethodCatalog,
}

impl SparcService {
    pub fn new(
        db: SparcDb,
        projects: ProjectManager,
        snapshots: SnapshotManager,
        catalog: MethodCatalog,
    ) -> Self {
        Self {
            db,
            projects,
            snapshots,
            catalog,
        }
    }

    pub async fn open(config: &SparcConfig) -> Result<Self> {
        let db = SparcDb::open(&config.state_store_path).await?;
        let projects = ProjectManager::new(&config.projects_root)?;
        let catalog = MethodCatalog::load(config.preprocessing_config.as_deref())?;
        Ok(Self::new(
            db,
            projects,
            SnapshotManager::new(&config.repo_root),
            catalog,
        ))
    }

    pub fn db(&self) -> &SparcDb {
        &self.db
    }

    pub fn projects(&self) -> &ProjectManager {
        &self.projects
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// Create a project or update its title and description. The directory
    /// layout is created on first use.
    pub async fn create_project(
        &self,
        slug: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<ProjectView> {
        let layout = self.projects.initialize(slug)?;
        let project = self
            .db
            .upsert_project(
                slug,
                title.unwrap_or(slug),
                description,
                &layout.root.display().to_string(),
            )
            .await?;
        info!(project = slug, root = %layout.root.display(), "Project ready");
        Ok(view(&project, &layout))
    }

    pub async fn get_project(&self, slug: &str) -> Result<ProjectView> {
        let project = self.require_project(slug).await?;
        let layout = self.projects.initialize(&project.slug)?;
        Ok(view(&project, &layout))
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectView>> {
        let mut views = Vec::new();
        for project in self.db.list_projects().await? {
            let layout = self.projects.initialize(&project.slug)?;
            views.push(view(&project, &layout));
        }
        Ok(views)
    }

    /// Delete the project's rows (children first), then its directory tree.
    pub async fn delete_project(&self, slug: &str) -> Result<()> {
        if !self.db.delete_project(slug).await? {
            return Err(ServiceError::not_found(format!("Project '{slug}' not found")));
        }
        self.projects.remove(slug)?;
        info!(project = slug, "Project deleted");
        Ok(())
    }

    async fn require_project(&self, slug: &str) -> Result<Project> {
        self.db
            .get_project(slug)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Project '{slug}' not found")))
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Validate paths, capture a snapshot, then persist the snapshot, the
    /// ingest record and its task together.
    pub async fn submit_ingest(&self, request: &IngestRequest) -> Result<IngestSubmitted> {
        let project = self.require_project(&request.project_slug).await?;
        if request.run_name.trim().is_empty() {
            return Err(ValidationError::EmptyRunName.into());
        }
        let layout = self.projects.initialize(&project.slug)?;
        let image = self.projects.resolve(&project.slug, &request.image_path)?;
        let panel = match &request.panel_csv_path {
            Some(panel) => Some(self.projects.resolve(&project.slug, panel)?),
            None => None,
        };

        let mut inputs = vec![image.clone()];
        inputs.extend(panel.iter().cloned());
        let snapshot = self.snapshots.capture(&layout, &request.run_name, &inputs)?;

        let submission = self
            .db
            .create_ingest_submission(
                project.id,
                &snapshot.to_new_snapshot(),
                &NewIngestRecord {
                    source_path: image.display().to_string(),
                    panel_csv_path: panel.map(|p| p.display().to_string()),
                    convert_to_zarr: request.convert_to_zarr,
                    request_metadata: request.metadata.clone(),
                },
            )
            .await?;

        Ok(IngestSubmitted {
            task_id: submission.task.id,
            ingest_record_id: submission.record.id,
            project: view(&project, &layout),
            snapshot: submission.snapshot,
        })
    }

    /// Validate a correction request and queue it.
    pub async fn submit_background(&self, request: &BackgroundRequest) -> Result<BackgroundSubmitted> {
        let project = self.require_project(&request.project_slug).await?;
        let record = self
            .db
            .get_ingest_record(request.ingest_record_id)
            .await?
            .filter(|record| record.project_id == project.id)
            .ok_or_else(|| ServiceError::not_found("Ingest record not found for project"))?;

        let parameters = self.catalog.validate(&request.method, &request.parameters)?;
        let channels = match &request.channels {
            Some(channels) => Some(
                channels
                    .iter()
                    .map(|&c| usize::try_from(c).map_err(|_| ValidationError::NegativeChannel))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        let output_name =
            sanitize_output_name(&request.output_name).ok_or(ValidationError::EmptyOutputName)?;
        // The result store lands under imagery/; reject names that would not.
        let layout = self.projects.initialize(&project.slug)?;
        self.projects
            .resolve(&project.slug, &layout.imagery().join(format!("{output_name}.zarr")))?;

        let submission = self
            .db
            .create_preprocess_submission(&NewPreprocessJob {
                project_id: project.id,
                ingest_record_id: record.id,
                method: request.method.clone(),
                output_name,
                parameters,
                channels,
            })
            .await?;

        Ok(BackgroundSubmitted {
            task_id: submission.task.id,
            job_id: submission.job.id,
            status: submission.job.status,
        })
    }

    pub async fn submit(&self, request: &RunRequest) -> Result<RunSubmitted> {
        Ok(match request {
            RunRequest::Ingest(request) => RunSubmitted::Ingest(self.submit_ingest(request).await?),
            RunRequest::Background(request) => {
                RunSubmitted::Background(self.submit_background(request).await?)
            }
        })
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub async fn ingest_status(&self, id: i64) -> Result<IngestRecord> {
        self.db
            .get_ingest_record(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Ingest record not found"))
    }

    pub async fn preprocess_status(&self, id: i64) -> Result<PreprocessJob> {
        self.db
            .get_preprocess_job(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Preprocess job not found"))
    }

    /// Declared correction methods with their parameter specs.
    pub fn background_config(&self) -> &[MethodSpec] {
        self.catalog.methods()
    }
}

fn view(project: &Project, layout: &ProjectLayout) -> ProjectView {
    ProjectView {
        slug: project.slug.clone(),
        title: project.title.clone(),
        description: project.description.clone(),
        root_path: project.root_path.clone(),
        created_at: project.created_at,
        layout: LayoutView::from(layout),
    }
}

/// Load a run configuration file (`.json`, `.yaml` or `.yml`) holding one
/// submission payload.
pub fn load_run_config(path: &Path) -> std::result::Result<RunRequest, ValidationError> {
    if !path.exists() {
        return Err(ValidationError::Payload(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(path).map_err(|err| {
        ValidationError::Payload(format!("Failed to read configuration file {}: {err}", path.display()))
    })?;
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let payload: Value = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str::<Option<Value>>(&text)
            .map_err(|err| ValidationError::Payload(err.to_string()))?
            .unwrap_or_else(|| Value::Object(Map::new())),
        "json" => serde_json::from_str(&text).map_err(|err| ValidationError::Payload(err.to_string()))?,
        _ => {
            return Err(ValidationError::Payload(format!(
                "Unsupported configuration format; expected JSON or YAML: {}",
                path.display()
            )))
        }
    };
    match payload {
        Value::Object(map) => RunRequest::from_payload(map),
        _ => Err(ValidationError::Payload(
            "Configuration payload must be a mapping of keys to values".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn payload_kind_follows_ingest_record_id() {
        let ingest = json!({
            "project_slug": "demo",
            "run_name": "run-1",
            "image_path": "imagery/image.ome.tiff",
            "convert_to_zarr": true
        });
        let Value::Object(map) = ingest else { unreachable!() };
        match RunRequest::from_payload(map).unwrap() {
            RunRequest::Ingest(request) => {
                assert!(request.convert_to_zarr);
                assert!(request.panel_csv_path.is_none());
                assert!(request.metadata.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let background = json!({
            "project_slug": "demo",
            "ingest_record_id": 3,
            "method": "basic",
            "output_name": "bg"
        });
        let Value::Object(map) = background else { unreachable!() };
        assert!(matches!(
            RunRequest::from_payload(map).unwrap(),
            RunRequest::Background(BackgroundRequest { ingest_record_id: 3, .. })
        ));
    }

    #[test]
    fn run_config_formats() {
        let tmp = TempDir::new().unwrap();
        let yaml = tmp.path().join("run.yaml");
        std::fs::write(
            &yaml,
            "project_slug: demo\ningest_record_id: 1\nmethod: adaptive\noutput_name: out\nparameters:\n  block_size: 21\n",
        )
        .unwrap();
        match load_run_config(&yaml).unwrap() {
            RunRequest::Background(request) => assert_eq!(request.parameters["block_size"], 21),
            other => panic!("unexpected {other:?}"),
        }

        let toml = tmp.path().join("run.toml");
        std::fs::write(&toml, "x = 1").unwrap();
        assert!(load_run_config(&toml)
            .unwrap_err()
            .to_string()
            .starts_with("Unsupported configuration format"));

        let list = tmp.path().join("run.json");
        std::fs::write(&list, "[1, 2]").unwrap();
        assert_eq!(
            load_run_config(&list).unwrap_err().to_string(),
            "Configuration payload must be a mapping of keys to values"
        );

        assert!(load_run_config(&tmp.path().join("missing.json"))
            .unwrap_err()
            .to_string()
            .starts_with("Configuration file not found"));
    }
}
