//! Schema creation for all Sparc tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//! Timestamps are milliseconds since the Unix epoch; JSON columns hold
//! serde_json-encoded values.

use crate::error::Result;
use crate::SparcDb;
use tracing::info;

impl SparcDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_project_tables().await?;
        self.create_job_tables().await?;
        self.create_queue_tables().await?;

        info!("State store schema verified");
        Ok(())
    }

    async fn create_project_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT,
                root_path TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Immutable once written
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS run_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                run_name TEXT NOT NULL,
                manifest_path TEXT NOT NULL UNIQUE,
                git_hash TEXT,
                dependencies TEXT NOT NULL,
                inputs TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_run_snapshots_project ON run_snapshots(project_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_job_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ingest_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                snapshot_id INTEGER REFERENCES run_snapshots(id),
                source_path TEXT NOT NULL,
                panel_csv_path TEXT,
                convert_to_zarr INTEGER NOT NULL DEFAULT 1,
                zarr_path TEXT,
                channel_metadata TEXT,
                scale_metadata TEXT,
                panel_mapping TEXT,
                request_metadata TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'running', 'completed', 'failed')),
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS preprocess_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                ingest_record_id INTEGER NOT NULL REFERENCES ingest_records(id),
                method TEXT NOT NULL,
                output_name TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '{}',
                channels TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'running', 'completed', 'failed')),
                result_path TEXT,
                qc_metrics TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ingest_records_project ON ingest_records(project_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_preprocess_jobs_project ON preprocess_jobs(project_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_preprocess_jobs_ingest ON preprocess_jobs(ingest_record_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS task_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                task TEXT NOT NULL,
                args TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending'
                    CHECK (state IN ('pending', 'claimed', 'done')),
                worker TEXT,
                enqueued_at INTEGER NOT NULL,
                claimed_at INTEGER,
                finished_at INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_queue_state ON task_queue(state, seq)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
