//! Submission commands - ingest, preprocess and run

use clap::Args;
use serde_json::{Map, Value};
use sparc::{load_run_config, BackgroundRequest, IngestRequest, SparcService};
use std::path::PathBuf;
use tracing::info;

use crate::cli::error::{CliError, CliResult, EXIT_INVALID};
use crate::cli::output::print_json;

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Project slug
    #[arg(long)]
    pub project: String,
    /// Run name recorded in the snapshot
    #[arg(long)]
    pub run_name: String,
    /// Image path, absolute or relative to the project root
    pub image: PathBuf,
    /// Channel-to-marker panel CSV
    #[arg(long)]
    pub panel: Option<PathBuf>,
    /// Convert the image into an imagery store under `imagery/`
    #[arg(long)]
    pub convert: bool,
    /// Extra request metadata as `key=value` (values parsed as JSON when possible)
    #[arg(long = "meta", value_parser = parse_key_value)]
    pub metadata: Vec<(String, Value)>,
}

#[derive(Args, Debug, Clone)]
pub struct PreprocessArgs {
    #[arg(long)]
    pub project: String,
    /// Completed ingest record to correct
    #[arg(long)]
    pub ingest: i64,
    /// Correction method (see `sparc methods`)
    #[arg(long)]
    pub method: String,
    /// Name of the result store
    #[arg(long)]
    pub output: String,
    /// Method parameter as `key=value` (values parsed as JSON when possible)
    #[arg(long = "param", value_parser = parse_key_value)]
    pub parameters: Vec<(String, Value)>,
    /// Channel indices to correct (default: all)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub channels: Option<Vec<i64>>,
}

/// `key=value`; the value is JSON if it parses as JSON, a string otherwise.
pub fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn to_map(pairs: Vec<(String, Value)>) -> Map<String, Value> {
    pairs.into_iter().collect()
}

pub async fn ingest(service: &SparcService, args: IngestArgs) -> CliResult {
    let request = IngestRequest {
        project_slug: args.project,
        run_name: args.run_name,
        image_path: args.image,
        convert_to_zarr: args.convert,
        panel_csv_path: args.panel,
        metadata: to_map(args.metadata),
    };
    let submitted = service.submit_ingest(&request).await?;
    info!(
        ingest_record_id = submitted.ingest_record_id,
        task_id = %submitted.task_id,
        "Ingestion queued"
    );
    print_json(&submitted)
}

pub async fn preprocess(service: &SparcService, args: PreprocessArgs) -> CliResult {
    let request = BackgroundRequest {
        project_slug: args.project,
        ingest_record_id: args.ingest,
        method: args.method,
        output_name: args.output,
        parameters: to_map(args.parameters),
        channels: args.channels,
    };
    let submitted = service.submit_background(&request).await?;
    info!(job_id = submitted.job_id, task_id = %submitted.task_id, "Preprocessing queued");
    print_json(&submitted)
}

/// Submit the request held in a JSON or YAML file.
pub async fn run_config(service: &SparcService, path: PathBuf) -> CliResult {
    let request = load_run_config(&path).map_err(|err| CliError::new(err.to_string(), EXIT_INVALID))?;
    let submitted = service.submit(&request).await?;
    print_json(&submitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_values_parse_json_then_fall_back_to_strings() {
        assert_eq!(
            parse_key_value("rolling_ball_radius=25").unwrap(),
            ("rolling_ball_radius".to_string(), Value::from(25))
        );
        assert_eq!(
            parse_key_value("local_weighting=gaussian").unwrap(),
            ("local_weighting".to_string(), Value::from("gaussian"))
        );
        assert_eq!(
            parse_key_value("flag=true").unwrap().1,
            Value::Bool(true)
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=3").is_err());
    }
}
