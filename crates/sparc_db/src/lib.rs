//! Transactional state store for Sparc
//!
//! The relational store is the single source of truth for projects, run
//! snapshots, ingestion records, preprocessing jobs and the durable task
//! queue. Everything goes through [`SparcDb`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use sparc_db::{SparcDb, Result};
//!
//! let db = SparcDb::open("~/.sparc/sparc.sqlite").await?;
//! let project = db.upsert_project("demo", "Demo", None, "/data/demo").await?;
//! let task = db.claim_next_task("worker-1").await?;
//! ```

mod error;
mod schema;
mod types;

mod ingest;
mod preprocess;
mod projects;
mod queue;
mod snapshots;

pub use error::{DbError, Result};
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sparc_protocol::JobStatus;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the state store.
#[derive(Clone)]
pub struct SparcDb {
    pool: SqlitePool,
}

impl SparcDb {
    /// Open or create a store at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options(path, true))
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "State store opened");

        Ok(db)
    }

    /// Open an existing store (fails if not exists).
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DbError::not_found("State store", path.display()));
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options(path, false))
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Underlying connection pool (escape hatch for complex queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl SparcDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

/// Settings applied to every pooled connection.
fn connect_options(path: &Path, create: bool) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}

/// `'queued','running'`-style list of states `next` may overwrite.
pub(crate) fn predecessor_list(next: JobStatus) -> String {
    JobStatus::predecessors(next)
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn parse_status(raw: &str) -> Result<JobStatus> {
    raw.parse::<JobStatus>()
        .map_err(|_| DbError::unknown_value("job status", raw))
}

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}
