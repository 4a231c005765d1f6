//! Runtime configuration shared by the service and the worker.

use crate::defaults::{DEFAULT_LOG_LEVEL, DEFAULT_POLL_INTERVAL};
use crate::paths;
use std::path::PathBuf;
use std::time::Duration;

/// Explicit configuration built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct SparcConfig {
    /// SQLite file holding projects, snapshots, jobs and the task queue
    pub state_store_path: PathBuf,
    /// Base directory under which every project root lives
    pub projects_root: PathBuf,
    /// Service repository used for git revision and dependency capture
    pub repo_root: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    /// Per-plane thread pool size (None = one thread per core)
    pub worker_threads: Option<usize>,
    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval: Duration,
    /// Optional YAML file declaring preprocessing methods
    pub preprocessing_config: Option<PathBuf>,
}

impl SparcConfig {
    /// Configuration rooted in a single directory (tests and local runs).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_store_path: root.join("sparc.sqlite"),
            projects_root: root.join("projects"),
            repo_root: root.clone(),
            log_dir: root.join("logs"),
            ..Self::default()
        }
    }
}

impl Default for SparcConfig {
    fn default() -> Self {
        Self {
            state_store_path: paths::default_state_store_path(),
            projects_root: paths::default_projects_root(),
            repo_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            log_dir: paths::default_logs_dir(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            worker_threads: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            preprocessing_config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_keeps_everything_under_root() {
        let config = SparcConfig::rooted_at("/tmp/sparc-test");
        assert!(config.state_store_path.starts_with("/tmp/sparc-test"));
        assert!(config.projects_root.starts_with("/tmp/sparc-test"));
        assert!(config.log_dir.starts_with("/tmp/sparc-test"));
        assert_eq!(config.log_level, "info");
        assert!(config.preprocessing_config.is_none());
    }
}
