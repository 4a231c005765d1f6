//! Run snapshot operations
//!
//! Snapshots are insert-only; there is no update path.

use crate::error::{DbError, Result};
use crate::types::{NewSnapshot, RunSnapshot};
use crate::{decode_json, encode_json, SparcDb};
use sqlx::{Row, SqliteConnection};
use tracing::info;

impl SparcDb {
    pub async fn get_snapshot(&self, id: i64) -> Result<Option<RunSnapshot>> {
        let row = sqlx::query("SELECT * FROM run_snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_snapshot).transpose()
    }

    pub async fn list_snapshots(&self, project_id: i64) -> Result<Vec<RunSnapshot>> {
        let rows = sqlx::query(
            "SELECT * FROM run_snapshots WHERE project_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_snapshot).collect()
    }

    /// Delete a snapshot row. Ingestion records that referenced it keep
    /// existing with a NULL snapshot reference. The manifest file is left on
    /// disk.
    pub async fn delete_snapshot(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let detached = sqlx::query("UPDATE ingest_records SET snapshot_id = NULL WHERE snapshot_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let deleted = sqlx::query("DELETE FROM run_snapshots WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if deleted > 0 {
            info!(snapshot_id = id, detached, "Snapshot deleted");
        }
        Ok(deleted > 0)
    }
}

/// Insert a snapshot inside an open transaction.
pub(crate) async fn insert_snapshot(
    conn: &mut SqliteConnection,
    project_id: i64,
    snapshot: &NewSnapshot,
) -> Result<RunSnapshot> {
    let result = sqlx::query(
        r#"
        INSERT INTO run_snapshots
            (project_id, run_name, manifest_path, git_hash, dependencies, inputs, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(&snapshot.run_name)
    .bind(&snapshot.manifest_path)
    .bind(&snapshot.git_hash)
    .bind(encode_json(&snapshot.dependencies)?)
    .bind(encode_json(&snapshot.inputs)?)
    .bind(snapshot.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::DuplicateSnapshot {
            manifest: snapshot.manifest_path.clone(),
        },
        other => DbError::Sqlx(other),
    })?;

    let id = result.last_insert_rowid();
    let row = sqlx::query("SELECT * FROM run_snapshots WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    row_to_snapshot(&row)
}

fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<RunSnapshot> {
    Ok(RunSnapshot {
        id: row.get("id"),
        project_id: row.get("project_id"),
        run_name: row.get("run_name"),
        manifest_path: row.get("manifest_path"),
        git_hash: row.get("git_hash"),
        dependencies: decode_json(row.get("dependencies"))?.unwrap_or_default(),
        inputs: decode_json(row.get("inputs"))?.unwrap_or_default(),
        created_at: SparcDb::millis_to_datetime(row.get("created_at")),
    })
}
