//! Durable task queue
//!
//! Tasks live in the same store as the jobs they point at, so a submission
//! and its task commit together. Delivery is at-least-once: a claimed task
//! whose worker dies is never re-offered automatically.

use crate::error::{DbError, Result};
use crate::types::{QueueStats, QueuedTask, TaskState};
use crate::SparcDb;
use serde_json::Value;
use sparc_protocol::{TaskHandle, TaskKind};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

impl SparcDb {
    /// Enqueue a task on its own.
    pub async fn enqueue(&self, kind: TaskKind, args: &Value) -> Result<TaskHandle> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut *conn, kind, args).await
    }

    /// Claim the oldest pending task for `worker`.
    ///
    /// The select and the claim run as one statement, so two workers can
    /// never claim the same task.
    pub async fn claim_next_task(&self, worker: &str) -> Result<Option<QueuedTask>> {
        let row = sqlx::query(
            r#"
            UPDATE task_queue SET state = 'claimed', worker = ?, claimed_at = ?
            WHERE state = 'pending' AND seq = (
                SELECT seq FROM task_queue WHERE state = 'pending' ORDER BY seq ASC LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker)
        .bind(Self::now_millis())
        .fetch_optional(&self.pool)
        .await?;

        let task = row.as_ref().map(row_to_task).transpose()?;
        if let Some(task) = &task {
            debug!(task_id = %task.id, task = %task.kind, worker, "Task claimed");
        }
        Ok(task)
    }

    /// Mark a claimed task as finished.
    pub async fn finish_task(&self, task_id: &str) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE task_queue SET state = 'done', finished_at = ? WHERE id = ? AND state = 'claimed'",
        )
        .bind(Self::now_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::TaskNotClaimed {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<QueuedTask>> {
        let row = sqlx::query("SELECT * FROM task_queue WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0) as pending,
                COALESCE(SUM(CASE WHEN state = 'claimed' THEN 1 ELSE 0 END), 0) as claimed,
                COALESCE(SUM(CASE WHEN state = 'done' THEN 1 ELSE 0 END), 0) as done
            FROM task_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            total: row.get::<i64, _>("total") as u64,
            pending: row.get::<i64, _>("pending") as u64,
            claimed: row.get::<i64, _>("claimed") as u64,
            done: row.get::<i64, _>("done") as u64,
        })
    }
}

/// Insert a pending task on an open connection or transaction.
pub(crate) async fn insert_task(
    conn: &mut SqliteConnection,
    kind: TaskKind,
    args: &Value,
) -> Result<TaskHandle> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO task_queue (id, task, args, state, enqueued_at) VALUES (?, ?, ?, 'pending', ?)",
    )
    .bind(&id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(args)?)
    .bind(SparcDb::now_millis())
    .execute(&mut *conn)
    .await?;

    info!(task_id = %id, task = %kind, "Task enqueued");
    Ok(TaskHandle { id, task: kind })
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<QueuedTask> {
    let task: String = row.get("task");
    let state: String = row.get("state");
    let args: String = row.get("args");
    Ok(QueuedTask {
        id: row.get("id"),
        kind: task
            .parse()
            .map_err(|_| DbError::unknown_value("task kind", task.as_str()))?,
        args: serde_json::from_str(&args)?,
        state: TaskState::parse(&state)
            .ok_or_else(|| DbError::unknown_value("task state", state.as_str()))?,
        worker: row.get("worker"),
        enqueued_at: SparcDb::millis_to_datetime(row.get("enqueued_at")),
    })
}
