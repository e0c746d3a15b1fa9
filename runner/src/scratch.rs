use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    fs,
    ops::Deref,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, error};

/// Prefix of every intermediate file, makes leftovers of killed runs easy to spot
pub static SCRATCH_PREFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(format!(".bp-scratch-{}_", process::id()));
    string
});

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Intermediate file that is removed once dropped
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }

        let result = if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };

        match result {
            Ok(()) => debug!(path = ?self.path, "Removed intermediate file"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to remove intermediate file"),
        }
    }
}

impl ScratchFile {
    /// reserve a unique name in `dir` ending in `suffix`, nothing is created on disk
    pub fn new(dir: &Path, suffix: &str) -> Self {
        let mut name = SCRATCH_PREFIX.clone();
        name.push(format!("{}{suffix}", COUNTER.fetch_add(1, Ordering::SeqCst)));

        Self {
            path: dir.join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for ScratchFile {
    type Target = PathBuf;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_files_are_unique_and_removed_on_drop() {
        let directory = tempfile::tempdir().unwrap();
        let first = ScratchFile::new(directory.path(), ".nc");
        let second = ScratchFile::new(directory.path(), ".nc");

        assert_ne!(first.path(), second.path());
        fs::write(first.path(), "partial").unwrap();

        let kept = first.path().to_path_buf();
        drop(first);
        drop(second);

        assert!(!kept.exists());
    }
}
