use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Filesystem layout of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectLayout {
    pub root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn imagery(&self) -> PathBuf {
        self.root.join("imagery")
    }

    pub fn masks(&self) -> PathBuf {
        self.root.join("masks")
    }

    /// Tabular annotation stores.
    pub fn h5ad(&self) -> PathBuf {
        self.root.join("h5ad")
    }

    pub fn spatialdata(&self) -> PathBuf {
        self.root.join("SpatialData")
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn snapshots(&self) -> PathBuf {
        self.configs().join("snapshots")
    }

    /// Logical name and path of every managed directory.
    pub fn subdirectories(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("imagery", self.imagery()),
            ("masks", self.masks()),
            ("h5ad", self.h5ad()),
            ("spatialdata", self.spatialdata()),
            ("configs", self.configs()),
            ("logs", self.logs()),
            ("snapshots", self.snapshots()),
        ]
    }

    /// Create every managed directory. Safe to call repeatedly.
    pub fn ensure(&self) -> io::Result<()> {
        for (_, dir) in self.subdirectories() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path().join("demo"));

        layout.ensure().unwrap();
        std::fs::write(layout.imagery().join("keep.txt"), "x").unwrap();
        layout.ensure().unwrap();

        for (_, dir) in layout.subdirectories() {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        assert!(layout.imagery().join("keep.txt").exists());
    }

    #[test]
    fn snapshots_live_under_configs() {
        let layout = ProjectLayout::new("/p/demo");
        assert_eq!(layout.snapshots(), PathBuf::from("/p/demo/configs/snapshots"));
        assert_eq!(layout.subdirectories().len(), 7);
    }
}
