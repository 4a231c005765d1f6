//! Project operations

use crate::error::{DbError, Result};
use crate::types::Project;
use crate::SparcDb;
use sqlx::Row;
use tracing::info;

impl SparcDb {
    /// Create a project, or update title/description/root of an existing one.
    pub async fn upsert_project(
        &self,
        slug: &str,
        title: &str,
        description: Option<&str>,
        root_path: &str,
    ) -> Result<Project> {
        let now = Self::now_millis();
        sqlx::query(
            r#"
            INSERT INTO projects (slug, title, description, root_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(slug) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                root_path = excluded.root_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(slug)
        .bind(title)
        .bind(description)
        .bind(root_path)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_project(slug)
            .await?
            .ok_or_else(|| DbError::not_found("Project", format!("'{slug}'")))
    }

    pub async fn get_project(&self, slug: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_project))
    }

    pub async fn get_project_by_id(&self, id: i64) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_project))
    }

    /// All projects, oldest first.
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_project).collect())
    }

    /// Delete a project and everything it owns.
    ///
    /// Children go first: preprocessing jobs, ingestion records, snapshots.
    /// Returns false if the slug is unknown.
    pub async fn delete_project(&self, slug: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id FROM projects WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&mut *tx)
            .await?;
        let project_id = match row {
            Some(row) => row.get::<i64, _>("id"),
            None => {
                tx.rollback().await?;
                return Ok(false);
            }
        };

        let jobs = sqlx::query("DELETE FROM preprocess_jobs WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let records = sqlx::query("DELETE FROM ingest_records WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let snapshots = sqlx::query("DELETE FROM run_snapshots WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(slug, jobs, records, snapshots, "Project deleted");
        Ok(true)
    }
}

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        slug: row.get("slug"),
        title: row.get("title"),
        description: row.get("description"),
        root_path: row.get("root_path"),
        created_at: SparcDb::millis_to_datetime(row.get("created_at")),
        updated_at: SparcDb::millis_to_datetime(row.get("updated_at")),
    }
}
