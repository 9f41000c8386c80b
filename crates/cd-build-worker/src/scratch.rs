//! Per-build scratch working directories (spec §4.3 step 2). Grounded on
//! the teacher's `deployer/src/deployment/storage_manager.rs` convention of
//! one directory per unit of work, removed unconditionally on every exit
//! path.

use std::path::{Path, PathBuf};

use cd_common::ids::BuildId;
use cd_common::{Error, ErrorKind};
use tempfile::TempDir;

/// Owns a scratch directory for the lifetime of a single build. Dropping it
/// removes the directory tree; `cleanup` exists so the worker can log
/// failures instead of silently losing them in a `Drop`.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn create(prefix_root: &Path, build_id: BuildId) -> Result<Self, Error> {
        std::fs::create_dir_all(prefix_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("build-{build_id}-"))
            .tempdir_in(prefix_root)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.path().join("src")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_dir_exists_while_held_and_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::create(root.path(), BuildId::new()).unwrap();
            assert!(scratch.path().exists());
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
