//! Status and methods commands

use clap::Subcommand;
use sparc::SparcService;

use crate::cli::error::CliResult;
use crate::cli::output::print_json;

#[derive(Subcommand, Debug, Clone)]
pub enum StatusTarget {
    /// Ingestion record
    Ingest { id: i64 },
    /// Background correction job
    Job { id: i64 },
}

pub async fn run(service: &SparcService, target: StatusTarget) -> CliResult {
    match target {
        StatusTarget::Ingest { id } => print_json(&service.ingest_status(id).await?),
        StatusTarget::Job { id } => print_json(&service.preprocess_status(id).await?),
    }
}

/// Print the declared correction methods and their parameters.
pub fn methods(service: &SparcService) -> CliResult {
    print_json(service.background_config())
}
