//! Sparc command-line entry point
//!
//! Usage:
//!   sparc project create demo --title "Demo"
//!   sparc ingest --project demo --run-name run-1 --convert imagery/image.ome.tiff
//!   sparc preprocess --project demo --ingest 1 --method basic --output bg --param rolling_ball_radius=25
//!   sparc run --config run.yaml
//!   sparc worker

use clap::{Parser, Subcommand};
use sparc::SparcService;
use sparc_logging::{init_logging, LogConfig};
use sparc_protocol::SparcConfig;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::error::{CliError, CliResult, EXIT_INVALID};

#[derive(Parser, Debug)]
#[command(name = "sparc", about = "Spatial imaging preprocessing backend", version)]
struct Cli {
    /// Mirror logs on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(flatten)]
    config: cli::config::ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: cli::project::ProjectAction,
    },
    /// Queue an image for ingestion
    Ingest(cli::submit::IngestArgs),
    /// Queue a background correction job
    Preprocess(cli::submit::PreprocessArgs),
    /// Submit the request described in a JSON or YAML file
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Show an ingest record or a correction job
    Status {
        #[command(subcommand)]
        target: cli::status::StatusTarget,
    },
    /// List correction methods and their parameters
    Methods,
    /// Process queued tasks
    Worker {
        /// Drain the queue once and exit
        #[arg(long)]
        once: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.config.resolve();

    if let Err(err) = init_logging(LogConfig {
        app_name: "sparc",
        log_dir: &config.log_dir,
        level: &config.log_level,
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: {err:#}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ERROR: failed to start async runtime: {err}");
            return ExitCode::from(EXIT_INVALID);
        }
    };

    match runtime.block_on(run_command(cli.command, &config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err.message, "Command failed");
            eprintln!("{err}");
            ExitCode::from(err.exit_code)
        }
    }
}

async fn run_command(command: Commands, config: &SparcConfig) -> CliResult {
    match command {
        Commands::Project { action } => cli::project::run(&open_service(config).await?, action).await,
        Commands::Ingest(args) => cli::submit::ingest(&open_service(config).await?, args).await,
        Commands::Preprocess(args) => {
            cli::submit::preprocess(&open_service(config).await?, args).await
        }
        Commands::Run { config: path } => {
            cli::submit::run_config(&open_service(config).await?, path).await
        }
        Commands::Status { target } => cli::status::run(&open_service(config).await?, target).await,
        Commands::Methods => cli::status::methods(&open_service(config).await?),
        Commands::Worker { once } => cli::worker::run(config, once).await,
    }
}

async fn open_service(config: &SparcConfig) -> CliResult<SparcService> {
    SparcService::open(config).await.map_err(|err| {
        CliError::new(err.to_string(), EXIT_INVALID).with_suggestion(format!(
            "TRY: check --database ({}) and --projects-root ({})",
            config.state_store_path.display(),
            config.projects_root.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn preprocess_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sparc",
            "preprocess",
            "--project",
            "demo",
            "--ingest",
            "3",
            "--method",
            "basic",
            "--output",
            "bg",
            "--param",
            "rolling_ball_radius=0",
            "--channels",
            "0,2",
        ])
        .unwrap();
        match cli.command {
            Commands::Preprocess(args) => {
                assert_eq!(args.ingest, 3);
                assert_eq!(args.channels, Some(vec![0, 2]));
                assert_eq!(args.parameters[0].0, "rolling_ball_radius");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
