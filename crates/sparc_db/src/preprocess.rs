//! Preprocessing job operations

use crate::error::{DbError, Result};
use crate::queue::insert_task;
use crate::types::*;
use crate::{decode_json, encode_json, parse_status, predecessor_list, SparcDb};
use sparc_protocol::{JobStatus, QcMetrics, TaskKind};
use sqlx::Row;
use tracing::{debug, info};

impl SparcDb {
    /// Persist a queued preprocessing job and its task in one transaction.
    ///
    /// Fails with `NotFound` (writing nothing) when the ingestion record does
    /// not exist or belongs to another project.
    pub async fn create_preprocess_submission(
        &self,
        job: &NewPreprocessJob,
    ) -> Result<PreprocessSubmission> {
        let mut tx = self.pool.begin().await?;

        let owner = sqlx::query("SELECT project_id FROM ingest_records WHERE id = ?")
            .bind(job.ingest_record_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get::<i64, _>("project_id"));
        if owner != Some(job.project_id) {
            tx.rollback().await?;
            return Err(DbError::ForeignIngestRecord {
                record_id: job.ingest_record_id,
                project_id: job.project_id,
            });
        }

        let channels = match &job.channels {
            Some(channels) => Some(encode_json(channels)?),
            None => None,
        };
        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO preprocess_jobs
                (project_id, ingest_record_id, method, output_name, parameters, channels,
                 progress, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0.0, 'queued', ?, ?)
            "#,
        )
        .bind(job.project_id)
        .bind(job.ingest_record_id)
        .bind(&job.method)
        .bind(&job.output_name)
        .bind(encode_json(&job.parameters)?)
        .bind(channels)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let job_id = result.last_insert_rowid();

        let task = insert_task(
            &mut *tx,
            TaskKind::BackgroundPreprocess,
            &serde_json::json!({ "job_id": job_id }),
        )
        .await?;

        tx.commit().await?;

        let job = self
            .get_preprocess_job(job_id)
            .await?
            .ok_or_else(|| DbError::not_found("Preprocess job", job_id))?;

        info!(job_id, method = %job.method, task_id = %task.id, "Preprocessing submitted");
        Ok(PreprocessSubmission { job, task })
    }

    pub async fn get_preprocess_job(&self, id: i64) -> Result<Option<PreprocessJob>> {
        let row = sqlx::query("SELECT * FROM preprocess_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_preprocess_job).transpose()
    }

    pub async fn list_preprocess_jobs(&self, project_id: i64) -> Result<Vec<PreprocessJob>> {
        let rows = sqlx::query(
            "SELECT * FROM preprocess_jobs WHERE project_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_preprocess_job).collect()
    }

    pub async fn count_preprocess_jobs(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM preprocess_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Pickup: `queued|running -> running`. Starts a new run, so progress is
    /// reset to `progress`.
    pub async fn mark_preprocess_running(&self, id: i64, progress: f64) -> Result<PreprocessJob> {
        let sql = format!(
            "UPDATE preprocess_jobs SET status = 'running', progress = ?, error_message = NULL, \
             updated_at = ? WHERE id = ? AND status IN ({})",
            predecessor_list(JobStatus::Running)
        );
        let affected = sqlx::query(&sql)
            .bind(progress)
            .bind(Self::now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.after_job_transition(id, JobStatus::Running, affected).await
    }

    /// Advance progress of a running job. Never moves it backwards.
    pub async fn update_preprocess_progress(&self, id: i64, progress: f64) -> Result<()> {
        sqlx::query(
            "UPDATE preprocess_jobs SET progress = MAX(progress, ?), updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(progress.clamp(0.0, 1.0))
        .bind(Self::now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Success: result path and QC set, completed, error cleared, progress 1.0.
    pub async fn complete_preprocess(
        &self,
        id: i64,
        result_path: &str,
        qc_metrics: &QcMetrics,
    ) -> Result<PreprocessJob> {
        let sql = format!(
            r#"UPDATE preprocess_jobs SET
                status = 'completed',
                result_path = ?,
                qc_metrics = ?,
                error_message = NULL,
                progress = 1.0,
                updated_at = ?
            WHERE id = ? AND status IN ({})"#,
            predecessor_list(JobStatus::Completed)
        );
        let affected = sqlx::query(&sql)
            .bind(result_path)
            .bind(encode_json(qc_metrics)?)
            .bind(Self::now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.after_job_transition(id, JobStatus::Completed, affected).await
    }

    pub async fn fail_preprocess(&self, id: i64, message: &str) -> Result<PreprocessJob> {
        let sql = format!(
            "UPDATE preprocess_jobs SET status = 'failed', error_message = ?, updated_at = ? \
             WHERE id = ? AND status IN ({})",
            predecessor_list(JobStatus::Failed)
        );
        let affected = sqlx::query(&sql)
            .bind(message)
            .bind(Self::now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.after_job_transition(id, JobStatus::Failed, affected).await
    }

    async fn after_job_transition(
        &self,
        id: i64,
        next: JobStatus,
        affected: u64,
    ) -> Result<PreprocessJob> {
        let job = self
            .get_preprocess_job(id)
            .await?
            .ok_or_else(|| DbError::not_found("Preprocess job", id))?;
        if affected == 0 {
            return Err(DbError::InvalidTransition {
                entity: "Preprocess job",
                id,
                from: job.status,
                to: next,
            });
        }
        debug!(job_id = id, status = %next, "Preprocess job transitioned");
        Ok(job)
    }
}

fn row_to_preprocess_job(row: &sqlx::sqlite::SqliteRow) -> Result<PreprocessJob> {
    let status: String = row.get("status");
    Ok(PreprocessJob {
        id: row.get("id"),
        project_id: row.get("project_id"),
        ingest_record_id: row.get("ingest_record_id"),
        method: row.get("method"),
        output_name: row.get("output_name"),
        parameters: decode_json(row.get("parameters"))?.unwrap_or_default(),
        channels: decode_json(row.get("channels"))?,
        progress: row.get("progress"),
        status: parse_status(&status)?,
        result_path: row.get("result_path"),
        qc_metrics: decode_json(row.get("qc_metrics"))?,
        error_message: row.get("error_message"),
        created_at: SparcDb::millis_to_datetime(row.get("created_at")),
        updated_at: SparcDb::millis_to_datetime(row.get("updated_at")),
    })
}
