//! Run snapshots
//!
//! A snapshot is a JSON manifest written once under the project's snapshot
//! directory. It records the run name, capture time, the service
//! repository's git revision, digests of the dependency manifests found in
//! the repository and digests of the run's inputs.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use sparc_db::NewSnapshot;
use sparc_protocol::paths::expand_home;
use sparc_protocol::{snapshot_slug, FileDigest};
use sparc_security::{sha256_file, ProjectLayout};
use tracing::{debug, info};

/// Dependency manifests looked up relative to the repository root, in order.
pub const DEPENDENCY_CANDIDATES: [&str; 3] = ["Cargo.toml", "Cargo.lock", "rust-toolchain.toml"];

/// A captured snapshot, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub run_name: String,
    pub manifest_path: PathBuf,
    pub git_hash: Option<String>,
    pub dependencies: Vec<FileDigest>,
    pub inputs: Vec<FileDigest>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn to_new_snapshot(&self) -> NewSnapshot {
        NewSnapshot {
            run_name: self.run_name.clone(),
            manifest_path: self.manifest_path.display().to_string(),
            git_hash: self.git_hash.clone(),
            dependencies: self.dependencies.clone(),
            inputs: self.inputs.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    repo_root: PathBuf,
}

impl SnapshotManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Write a new manifest under `layout` and return what it holds.
    pub fn capture(
        &self,
        layout: &ProjectLayout,
        run_name: &str,
        inputs: &[PathBuf],
    ) -> io::Result<SnapshotRecord> {
        let snapshot_dir = layout.snapshots();
        std::fs::create_dir_all(&snapshot_dir)?;

        let created_at = Utc::now();
        let dependencies = self.dependency_digests()?;
        let inputs = input_digests(inputs, &layout.root)?;
        let git_hash = self.git_revision();

        let manifest = json!({
            "run_name": run_name,
            "created_at": created_at.to_rfc3339_opts(SecondsFormat::Micros, false),
            "git": { "hash": git_hash },
            "dependencies": dependencies,
            "inputs": inputs,
        });
        let body = serde_json::to_string_pretty(&manifest)?;

        let stem = format!("{}_{}", created_at.format("%Y%m%dT%H%M%SZ"), snapshot_slug(run_name));
        let manifest_path = write_new(&snapshot_dir, &stem, body.as_bytes())?;
        info!(
            manifest = %manifest_path.display(),
            inputs = inputs.len(),
            git_hash = git_hash.as_deref().unwrap_or("-"),
            "Snapshot captured"
        );

        Ok(SnapshotRecord {
            run_name: run_name.to_string(),
            manifest_path,
            git_hash,
            dependencies,
            inputs,
            created_at,
        })
    }

    fn dependency_digests(&self) -> io::Result<Vec<FileDigest>> {
        let mut digests = Vec::new();
        for candidate in DEPENDENCY_CANDIDATES {
            let path = self.repo_root.join(candidate);
            if !path.is_file() {
                continue;
            }
            digests.push(FileDigest {
                path: candidate.to_string(),
                sha256: sha256_file(&path)?,
            });
        }
        Ok(digests)
    }

    /// `HEAD` of the repository containing `repo_root`, if any.
    fn git_revision(&self) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.repo_root)
            .output();
        match output {
            Ok(output) if output.status.success() => {
                let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!hash.is_empty()).then_some(hash)
            }
            Ok(output) => {
                debug!(
                    repo = %self.repo_root.display(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "No git revision"
                );
                None
            }
            Err(err) => {
                debug!(error = %err, "git unavailable");
                None
            }
        }
    }
}

/// Digest inputs in order, skipping repeats. Paths inside `project_root` are
/// stored relative to it; missing files get an empty digest.
fn input_digests(paths: &[PathBuf], project_root: &Path) -> io::Result<Vec<FileDigest>> {
    let mut seen = HashSet::new();
    let mut digests = Vec::new();
    for path in paths {
        let expanded = expand_home(path);
        let resolved = expanded.canonicalize().unwrap_or(expanded);
        if !seen.insert(resolved.clone()) {
            continue;
        }
        let sha256 = if resolved.is_file() {
            sha256_file(&resolved)?
        } else {
            String::new()
        };
        let shown = resolved.strip_prefix(project_root).unwrap_or(&resolved);
        digests.push(FileDigest {
            path: shown.display().to_string(),
            sha256,
        });
    }
    Ok(digests)
}

/// Create `<stem>.json` without ever replacing an existing manifest; a name
/// already taken gets a numeric suffix.
fn write_new(dir: &Path, stem: &str, body: &[u8]) -> io::Result<PathBuf> {
    let mut attempt = 1;
    loop {
        let name = if attempt == 1 {
            format!("{stem}.json")
        } else {
            format!("{stem}-{attempt}.json")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(body)?;
                file.sync_all()?;
                return Ok(path);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ProjectLayout, SnapshotManager) {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        let root = tmp.path().join("projects").join("demo");
        fs::create_dir_all(&root).unwrap();
        let layout = ProjectLayout::new(root.canonicalize().unwrap());
        layout.ensure().unwrap();
        (tmp, layout, SnapshotManager::new(repo))
    }

    #[test]
    fn manifest_name_and_contents() {
        let (_tmp, layout, manager) = setup();
        let image = layout.imagery().join("image.ome.tiff");
        fs::write(&image, b"pixels").unwrap();

        let record = manager
            .capture(&layout, "My Run: #1", &[image.clone(), image.clone(), layout.root.join("absent.csv")])
            .unwrap();

        let name = record.manifest_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_my-run-1.json"), "{name}");
        assert_eq!(name.len(), "20240101T000000Z_my-run-1.json".len());
        assert!(record.manifest_path.starts_with(layout.snapshots()));

        assert_eq!(record.inputs.len(), 2);
        assert_eq!(record.inputs[0].path, "imagery/image.ome.tiff");
        assert_eq!(record.inputs[0].sha256, sparc_security::sha256(b"pixels"));
        assert_eq!(record.inputs[1].path, "absent.csv");
        assert_eq!(record.inputs[1].sha256, "");
        assert_eq!(record.dependencies.len(), 1);
        assert_eq!(record.dependencies[0].path, "Cargo.toml");

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&record.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["run_name"], "My Run: #1");
        assert!(manifest["git"].as_object().unwrap().contains_key("hash"));
        assert_eq!(manifest["inputs"][0]["path"], "imagery/image.ome.tiff");
    }

    #[test]
    fn hashing_is_deterministic_and_manifests_are_never_rewritten() {
        let (_tmp, layout, manager) = setup();
        let image = layout.imagery().join("image.ome.tiff");
        fs::write(&image, b"pixels").unwrap();

        let first = manager.capture(&layout, "run", &[image.clone()]).unwrap();
        let second = manager.capture(&layout, "run", &[image]).unwrap();
        assert_eq!(first.inputs, second.inputs);
        assert_eq!(first.dependencies, second.dependencies);
        assert_ne!(first.manifest_path, second.manifest_path);
        assert!(first.manifest_path.exists());
    }

    #[test]
    fn inputs_outside_project_stay_absolute() {
        let (tmp, layout, manager) = setup();
        let outside = tmp.path().join("elsewhere.tiff");
        fs::write(&outside, b"x").unwrap();
        let record = manager.capture(&layout, "run", &[outside.clone()]).unwrap();
        assert_eq!(
            PathBuf::from(&record.inputs[0].path),
            outside.canonicalize().unwrap()
        );
    }

    #[test]
    fn write_new_suffixes_taken_names() {
        let tmp = TempDir::new().unwrap();
        let a = write_new(tmp.path(), "s", b"1").unwrap();
        let b = write_new(tmp.path(), "s", b"2").unwrap();
        assert!(a.ends_with("s.json"));
        assert!(b.ends_with("s-2.json"));
        assert_eq!(fs::read_to_string(a).unwrap(), "1");
    }
}
