//! Queue worker
//!
//! - JobContext built once at startup, shared by every task
//! - run() consumes self; shutdown is requested through a channel
//! - one task at a time per worker; planes inside a task run on the pool
//! - an idle worker sleeps for `poll_interval`, a busy one polls again at once

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sparc_protocol::SparcConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::jobs::{self, JobContext, TaskSummary};

/// Worker configuration (plain data)
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &SparcConfig) -> Self {
        Self {
            worker_id: format!("sparc-worker-{}", std::process::id()),
            poll_interval: config.poll_interval,
        }
    }
}

/// Handle for controlling a running worker
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join_handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. The task in flight finishes first.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.join_handle.await?
    }
}

pub struct Worker {
    ctx: Arc<JobContext>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Worker {
    /// Returns (Worker, shutdown sender) - call run() on Worker.
    pub fn new(ctx: Arc<JobContext>, config: WorkerConfig) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                ctx,
                config,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Run the event loop on the current runtime.
    pub fn spawn(ctx: Arc<JobContext>, config: WorkerConfig) -> WorkerHandle {
        let (worker, shutdown_tx) = Self::new(ctx, config);
        WorkerHandle {
            shutdown_tx,
            join_handle: tokio::spawn(worker.run()),
        }
    }

    /// Main event loop - consumes self (can only be called once)
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "Worker polling queue");

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = poll.tick() => {
                    match process_next(&self.ctx, &self.config.worker_id).await {
                        Ok(Some(_)) => poll.reset_immediately(),
                        Ok(None) => {}
                        Err(e) => error!("Queue poll failed: {:#}", e),
                    }
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Drain the queue and return how many tasks were handled.
    pub async fn run_once(&self) -> Result<usize> {
        let mut handled = 0;
        while process_next(&self.ctx, &self.config.worker_id).await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }
}

/// Claim one task, run it and mark it done. `None` when the queue is empty.
pub async fn process_next(ctx: &JobContext, worker_id: &str) -> Result<Option<TaskSummary>> {
    let Some(task) = ctx.db.claim_next_task(worker_id).await? else {
        return Ok(None);
    };
    debug!(task_id = %task.id, task = %task.kind, "Claimed task");

    let summary = jobs::dispatch(ctx, &task).await?;
    ctx.db.finish_task(&task.id).await?;
    info!(
        task_id = %task.id,
        task = %task.kind,
        status = ?summary.status,
        "Task finished"
    );
    Ok(Some(summary))
}
