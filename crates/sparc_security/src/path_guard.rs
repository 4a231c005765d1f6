//! Path Guard - keeps every project path inside its project root
//!
//! # Security Model
//!
//! - Project slugs must match `[a-z0-9][a-z0-9_-]*`
//! - User paths are home-expanded, joined under the project root when
//!   relative, and canonicalized before the containment check
//! - Symlinks are followed; a link leading out of the root is an escape
//! - Paths that do not exist yet are resolved through their nearest existing
//!   ancestor, so outputs can be validated before they are written

use crate::layout::ProjectLayout;
use sparc_protocol::naming::is_valid_project_slug;
use sparc_protocol::paths::expand_home;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Invalid project slug '{slug}'")]
    InvalidSlug { slug: String },

    #[error("Path '{path}' resolves outside project root {root}")]
    PathEscape { path: String, root: String },

    #[error("Project '{slug}' has not been initialized")]
    NotInitialized { slug: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Creates and resolves project directories under a base directory.
#[derive(Debug, Clone)]
pub struct ProjectManager {
    /// Canonicalized base directory
    base: PathBuf,
}

impl ProjectManager {
    /// Create a manager rooted at `base`, creating the directory if needed.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = expand_home(base.as_ref());
        std::fs::create_dir_all(&base)?;
        let base = base.canonicalize()?;
        Ok(Self { base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Canonical root of `slug`, which must stay inside the base directory.
    pub fn project_root(&self, slug: &str) -> Result<PathBuf> {
        if !is_valid_project_slug(slug) {
            return Err(GuardError::InvalidSlug {
                slug: slug.to_string(),
            });
        }

        let candidate = self.base.join(slug);
        match resolve_lenient(&candidate)? {
            Some(root) if root.starts_with(&self.base) && root != self.base => Ok(root),
            _ => {
                warn!(slug, base = %self.base.display(), "Project root escapes base directory");
                Err(GuardError::PathEscape {
                    path: candidate.display().to_string(),
                    root: self.base.display().to_string(),
                })
            }
        }
    }

    /// Create the project layout if required.
    pub fn initialize(&self, slug: &str) -> Result<ProjectLayout> {
        let layout = ProjectLayout::new(self.project_root(slug)?);
        layout.ensure()?;
        Ok(layout)
    }

    /// Layout of an existing project; the directory structure is re-ensured.
    pub fn layout(&self, slug: &str) -> Result<ProjectLayout> {
        let layout = ProjectLayout::new(self.project_root(slug)?);
        if !layout.root.exists() {
            return Err(GuardError::NotInitialized {
                slug: slug.to_string(),
            });
        }
        layout.ensure()?;
        Ok(layout)
    }

    /// Resolve a user-supplied path inside the project root.
    ///
    /// Returns the canonical absolute path.
    pub fn resolve(&self, slug: &str, path: &Path) -> Result<PathBuf> {
        let root = self.project_root(slug)?;
        let expanded = expand_home(path);
        let candidate = if expanded.is_absolute() {
            expanded
        } else {
            root.join(expanded)
        };

        match resolve_lenient(&candidate)? {
            Some(resolved) if resolved.starts_with(&root) => Ok(resolved),
            _ => {
                warn!(
                    slug,
                    path = %path.display(),
                    "Rejected path outside project root"
                );
                Err(GuardError::PathEscape {
                    path: path.display().to_string(),
                    root: root.display().to_string(),
                })
            }
        }
    }

    /// Delete a project directory tree.
    pub fn remove(&self, slug: &str) -> Result<()> {
        let root = self.project_root(slug)?;
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        Ok(())
    }
}

/// Remove `.` and fold `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Canonicalize `path`, allowing a non-existent tail.
///
/// Returns `None` when the deepest existing entry is a dangling symlink,
/// since its target cannot be checked.
fn resolve_lenient(path: &Path) -> io::Result<Option<PathBuf>> {
    let normalized = normalize_lexically(path);
    let mut existing = normalized.as_path();
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(mut resolved) => {
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Ok(Some(resolved));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if std::fs::symlink_metadata(existing).is_ok() {
                    return Ok(None);
                }
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        tail.push(name.to_os_string());
                        existing = parent;
                    }
                    _ => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}
