//! Tabular annotation store.
//!
//! Each ingested image gets a companion SQLite file under the project's
//! `h5ad/` directory. Correction summaries accumulate in it keyed by output
//! name; writing the same output name again replaces that entry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sparc_protocol::QcMetrics;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{SinkError, SinkResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS background_corrections (
    output_name TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    parameters TEXT NOT NULL,
    channels TEXT NOT NULL,
    qc_metrics TEXT NOT NULL,
    result_path TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Annotation file for an image with the given file stem.
pub fn annotation_path(h5ad_dir: &Path, image_stem: &str) -> PathBuf {
    h5ad_dir.join(format!("{image_stem}.annotations.sqlite"))
}

/// One correction run as recorded next to the image.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionSummary {
    pub output_name: String,
    pub method: String,
    pub parameters: Map<String, Value>,
    pub channels: Vec<usize>,
    pub qc_metrics: QcMetrics,
    pub result_path: String,
    pub updated_at: DateTime<Utc>,
}

pub struct AnnotationStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl AnnotationStore {
    /// Open the store, creating the file and table when absent.
    pub async fn open(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(SinkError::io(parent))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace the entry for `summary.output_name`.
    pub async fn record(&self, summary: &CorrectionSummary) -> SinkResult<()> {
        sqlx::query(
            r#"
            INSERT INTO background_corrections
                (output_name, method, parameters, channels, qc_metrics, result_path, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(output_name) DO UPDATE SET
                method = excluded.method,
                parameters = excluded.parameters,
                channels = excluded.channels,
                qc_metrics = excluded.qc_metrics,
                result_path = excluded.result_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&summary.output_name)
        .bind(&summary.method)
        .bind(serde_json::to_string(&summary.parameters)?)
        .bind(serde_json::to_string(&summary.channels)?)
        .bind(serde_json::to_string(&summary.qc_metrics)?)
        .bind(&summary.result_path)
        .bind(summary.updated_at)
        .execute(&self.pool)
        .await?;
        debug!(path = %self.path.display(), output = %summary.output_name, "Recorded correction summary");
        Ok(())
    }

    pub async fn get(&self, output_name: &str) -> SinkResult<Option<CorrectionSummary>> {
        let row = sqlx::query("SELECT * FROM background_corrections WHERE output_name = ?")
            .bind(output_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_summary).transpose()
    }

    pub async fn list(&self) -> SinkResult<Vec<CorrectionSummary>> {
        let rows = sqlx::query("SELECT * FROM background_corrections ORDER BY output_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_summary).collect()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn row_to_summary(row: &SqliteRow) -> SinkResult<CorrectionSummary> {
    let parameters: String = row.try_get("parameters")?;
    let channels: String = row.try_get("channels")?;
    let qc_metrics: String = row.try_get("qc_metrics")?;
    Ok(CorrectionSummary {
        output_name: row.try_get("output_name")?,
        method: row.try_get("method")?,
        parameters: serde_json::from_str(&parameters)?,
        channels: serde_json::from_str(&channels)?,
        qc_metrics: serde_json::from_str(&qc_metrics)?,
        result_path: row.try_get("result_path")?,
        updated_at: row.try_get("updated_at")?,
    })
}
