//! Ingestion record operations

use crate::error::{DbError, Result};
use crate::queue::insert_task;
use crate::snapshots::insert_snapshot;
use crate::types::*;
use crate::{decode_json, encode_json, parse_status, predecessor_list, SparcDb};
use sparc_protocol::{JobStatus, TaskKind};
use sqlx::Row;
use tracing::{debug, info};

impl SparcDb {
    /// Persist a snapshot, a queued ingestion record and its task in one
    /// transaction.
    pub async fn create_ingest_submission(
        &self,
        project_id: i64,
        snapshot: &NewSnapshot,
        record: &NewIngestRecord,
    ) -> Result<IngestSubmission> {
        let mut tx = self.pool.begin().await?;

        let snapshot = insert_snapshot(&mut *tx, project_id, snapshot).await?;

        let now = Self::now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_records
                (project_id, snapshot_id, source_path, panel_csv_path, convert_to_zarr,
                 request_metadata, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(snapshot.id)
        .bind(&record.source_path)
        .bind(&record.panel_csv_path)
        .bind(record.convert_to_zarr)
        .bind(encode_json(&record.request_metadata)?)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let record_id = result.last_insert_rowid();

        let task = insert_task(
            &mut *tx,
            TaskKind::IngestImage,
            &serde_json::json!({ "ingest_record_id": record_id }),
        )
        .await?;

        tx.commit().await?;

        let record = self
            .get_ingest_record(record_id)
            .await?
            .ok_or_else(|| DbError::not_found("Ingest record", record_id))?;

        info!(
            ingest_record_id = record_id,
            snapshot_id = snapshot.id,
            task_id = %task.id,
            "Ingestion submitted"
        );
        Ok(IngestSubmission {
            snapshot,
            record,
            task,
        })
    }

    pub async fn get_ingest_record(&self, id: i64) -> Result<Option<IngestRecord>> {
        let row = sqlx::query("SELECT * FROM ingest_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_ingest_record).transpose()
    }

    pub async fn list_ingest_records(&self, project_id: i64) -> Result<Vec<IngestRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM ingest_records WHERE project_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ingest_record).collect()
    }

    /// Pickup: `queued|running -> running`.
    pub async fn mark_ingest_running(&self, id: i64) -> Result<IngestRecord> {
        let sql = format!(
            "UPDATE ingest_records SET status = 'running', error_message = NULL, updated_at = ? \
             WHERE id = ? AND status IN ({})",
            predecessor_list(JobStatus::Running)
        );
        let affected = sqlx::query(&sql)
            .bind(Self::now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.after_ingest_transition(id, JobStatus::Running, affected).await
    }

    /// Success: result fields set, status completed, error cleared.
    pub async fn complete_ingest(&self, id: i64, outcome: &IngestOutcome) -> Result<IngestRecord> {
        let sql = format!(
            r#"UPDATE ingest_records SET
                status = 'completed',
                zarr_path = ?,
                channel_metadata = ?,
                scale_metadata = ?,
                panel_mapping = ?,
                error_message = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ({})"#,
            predecessor_list(JobStatus::Completed)
        );
        let panel_mapping = match &outcome.panel_mapping {
            Some(mapping) => Some(encode_json(mapping)?),
            None => None,
        };
        let affected = sqlx::query(&sql)
            .bind(&outcome.zarr_path)
            .bind(encode_json(&outcome.channel_metadata)?)
            .bind(encode_json(&outcome.scale_metadata)?)
            .bind(panel_mapping)
            .bind(Self::now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.after_ingest_transition(id, JobStatus::Completed, affected).await
    }

    pub async fn fail_ingest(&self, id: i64, message: &str) -> Result<IngestRecord> {
        let sql = format!(
            "UPDATE ingest_records SET status = 'failed', error_message = ?, updated_at = ? \
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
        self.after_ingest_transition(id, JobStatus::Failed, affected).await
    }

    async fn after_ingest_transition(
        &self,
        id: i64,
        next: JobStatus,
        affected: u64,
    ) -> Result<IngestRecord> {
        let record = self
            .get_ingest_record(id)
            .await?
            .ok_or_else(|| DbError::not_found("Ingest record", id))?;
        if affected == 0 {
            return Err(DbError::InvalidTransition {
                entity: "Ingest record",
                id,
                from: record.status,
                to: next,
            });
        }
        debug!(ingest_record_id = id, status = %next, "Ingest record transitioned");
        Ok(record)
    }
}

fn row_to_ingest_record(row: &sqlx::sqlite::SqliteRow) -> Result<IngestRecord> {
    let status: String = row.get("status");
    Ok(IngestRecord {
        id: row.get("id"),
        project_id: row.get("project_id"),
        snapshot_id: row.get("snapshot_id"),
        source_path: row.get("source_path"),
        panel_csv_path: row.get("panel_csv_path"),
        convert_to_zarr: row.get("convert_to_zarr"),
        zarr_path: row.get("zarr_path"),
        channel_metadata: decode_json(row.get("channel_metadata"))?,
        scale_metadata: decode_json(row.get("scale_metadata"))?,
        panel_mapping: decode_json(row.get("panel_mapping"))?,
        request_metadata: decode_json(row.get("request_metadata"))?.unwrap_or_default(),
        status: parse_status(&status)?,
        error_message: row.get("error_message"),
        created_at: SparcDb::millis_to_datetime(row.get("created_at")),
        updated_at: SparcDb::millis_to_datetime(row.get("updated_at")),
    })
}
