use std::path::{Path, PathBuf};

/// Files kept under the bootenv state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    /// Lock file serializing journal recovery between processes.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("bootenv.lock")
    }

    pub fn initialize(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(self.journal_dir())
    }
}
