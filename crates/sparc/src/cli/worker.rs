//! Worker command - drain the task queue
//!
//! Runs until Ctrl-C, or with `--once` processes whatever is queued and
//! exits.

use anyhow::Context;
use serde_json::json;
use sparc_protocol::SparcConfig;
use sparc_worker::{JobContext, Worker, WorkerConfig};
use std::sync::Arc;
use tracing::info;

use crate::cli::error::CliResult;
use crate::cli::output::print_json;

pub async fn run(config: &SparcConfig, once: bool) -> CliResult {
    let ctx = Arc::new(JobContext::from_config(config).await?);
    let worker_config = WorkerConfig::from_config(config);

    if once {
        let (worker, _shutdown_tx) = Worker::new(ctx, worker_config);
        let processed = worker.run_once().await?;
        return print_json(&json!({ "processed": processed }));
    }

    let worker_id = worker_config.worker_id.clone();
    let handle = Worker::spawn(ctx, worker_config);
    info!(worker_id = %worker_id, "Worker running; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    handle.shutdown().await?;
    Ok(())
}
