//! Global options shared by every command.

use clap::Args;
use sparc_protocol::SparcConfig;
use std::path::PathBuf;

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// SQLite state store
    #[arg(long, env = "SPARC_DATABASE", global = true)]
    pub database: Option<PathBuf>,

    /// Directory holding every project root
    #[arg(long, env = "SPARC_PROJECTS_ROOT", global = true)]
    pub projects_root: Option<PathBuf>,

    /// Repository whose git revision and manifests are captured in snapshots
    #[arg(long, env = "SPARC_REPO_ROOT", global = true)]
    pub repo_root: Option<PathBuf>,

    #[arg(long, env = "SPARC_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Level for the sparc crates when RUST_LOG is unset
    #[arg(long, env = "SPARC_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Per-plane thread pool size (default: one per core)
    #[arg(long, env = "SPARC_WORKER_THREADS", global = true)]
    pub worker_threads: Option<usize>,

    /// YAML file declaring preprocessing methods
    #[arg(long, env = "SPARC_PREPROCESSING_CONFIG", global = true)]
    pub preprocessing_config: Option<PathBuf>,
}

impl ConfigArgs {
    /// Overlay the given options on the defaults.
    pub fn resolve(&self) -> SparcConfig {
        let mut config = SparcConfig::default();
        if let Some(path) = &self.database {
            config.state_store_path = path.clone();
        }
        if let Some(path) = &self.projects_root {
            config.projects_root = path.clone();
        }
        if let Some(path) = &self.repo_root {
            config.repo_root = path.clone();
        }
        if let Some(path) = &self.log_dir {
            config.log_dir = path.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if self.worker_threads.is_some() {
            config.worker_threads = self.worker_threads;
        }
        if self.preprocessing_config.is_some() {
            config.preprocessing_config = self.preprocessing_config.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_options_keep_defaults() {
        let defaults = SparcConfig::default();
        let config = ConfigArgs::default().resolve();
        assert_eq!(config.state_store_path, defaults.state_store_path);
        assert_eq!(config.log_level, defaults.log_level);
        assert_eq!(config.worker_threads, None);
    }

    #[test]
    fn options_override_defaults() {
        let args = ConfigArgs {
            database: Some(PathBuf::from("/tmp/s.sqlite")),
            worker_threads: Some(3),
            log_level: Some("debug".into()),
            ..ConfigArgs::default()
        };
        let config = args.resolve();
        assert_eq!(config.state_store_path, PathBuf::from("/tmp/s.sqlite"));
        assert_eq!(config.worker_threads, Some(3));
        assert_eq!(config.log_level, "debug");
    }
}
