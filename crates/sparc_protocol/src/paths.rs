use crate::defaults::{DEFAULT_PROJECTS_DIR, DEFAULT_STATE_STORE_FILE};
use std::path::PathBuf;

/// Resolve the Sparc home directory.
///
/// Priority:
/// 1) SPARC_HOME
/// 2) the user's home directory
/// 3) ./.sparc
pub fn sparc_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SPARC_HOME") {
        return PathBuf::from(override_path);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".sparc"),
        None => PathBuf::from(".").join(".sparc"),
    }
}

/// Default state store path: ~/.sparc/sparc.sqlite
pub fn default_state_store_path() -> PathBuf {
    sparc_home().join(DEFAULT_STATE_STORE_FILE)
}

/// Default projects root: ~/.sparc/projects
pub fn default_projects_root() -> PathBuf {
    sparc_home().join(DEFAULT_PROJECTS_DIR)
}

/// Default logs directory: ~/.sparc/logs
pub fn default_logs_dir() -> PathBuf {
    sparc_home().join("logs")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
