use crate::errors::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A per-execution scratch directory, exclusively owned by one execution.
///
/// Removal is tied to `Drop`, so the directory disappears on every exit path:
/// success, failure, timeout, or a panic unwinding through the orchestrator.
pub struct ScratchDir {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl ScratchDir {
    /// Create a fresh, uniquely-named scratch directory under `base`.
    pub fn new(base: &Path) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = base.join(&id);
        std::fs::create_dir_all(&path)?;

        info!("[SANDBOX] Created scratch dir: {:?}", path);

        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List regular files left in the scratch directory, skipping symlinks.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let Ok(ft) = entry.file_type() else { continue };
            if ft.is_file() && !ft.is_symlink() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Keep the directory on drop (debugging aid).
    pub fn keep(&mut self) {
        self.cleanup_on_drop = false;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("[SANDBOX] Failed to clean up scratch dir {:?}: {}", self.path, e);
            } else {
                info!("[SANDBOX] Cleaned up scratch dir: {:?}", self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let path;
        {
            let scratch = ScratchDir::new(base.path()).unwrap();
            path = scratch.path().to_path_buf();
            assert!(path.is_dir());
        }
        assert!(!path.exists());
    }

    #[test]
    fn keep_suppresses_cleanup() {
        let base = tempfile::tempdir().unwrap();
        let path;
        {
            let mut scratch = ScratchDir::new(base.path()).unwrap();
            scratch.keep();
            path = scratch.path().to_path_buf();
        }
        assert!(path.exists());
    }

    #[test]
    fn list_files_skips_directories() {
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(base.path()).unwrap();
        std::fs::write(scratch.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(scratch.path().join("sub")).unwrap();
        let files = scratch.list_files().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.txt"));
    }

    #[test]
    fn two_scratch_dirs_never_collide() {
        let base = tempfile::tempdir().unwrap();
        let a = ScratchDir::new(base.path()).unwrap();
        let b = ScratchDir::new(base.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
