use crate::BeError;
use bootenv_store::StateLayout;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock on a state directory's journal.
///
/// A journaled deep clone holds it from before its journal entry is opened
/// until the entry is committed or the clone is unwound. Recovery only replays
/// entries while holding it, so an entry it sees belongs to a clone that is no
/// longer running.
pub struct JournalLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(layout: &StateLayout) -> Result<(File, PathBuf), BeError> {
    let path = layout.lock_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    Ok((file, path))
}

impl JournalLock {
    /// Wait until no other clone holds the journal.
    pub fn acquire(layout: &StateLayout) -> Result<Self, BeError> {
        let (file, path) = open_lock_file(layout)?;
        file.lock_exclusive()?;
        debug!("journal lock taken: {}", path.display());
        Ok(Self { file, path })
    }

    /// `None` while a clone is in flight.
    pub fn try_acquire(layout: &StateLayout) -> Result<Option<Self>, BeError> {
        let (file, path) = open_lock_file(layout)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!("journal lock released: {}", self.path.display());
    }
}
