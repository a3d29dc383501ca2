//! On-disk state for bootenv.
//!
//! `StateLayout` names the files kept under the configured state directory and
//! `CloneJournal` is a write-ahead log of datasets created by multi-dataset
//! operations, so a process that dies mid-clone can be rolled back on the next
//! open.

pub mod journal;
pub mod layout;

pub use journal::{CloneJournal, JournalEntry, JournalOpKind, RollbackStep};
pub use layout::StateLayout;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("journal entry not found: {0}")]
    EntryNotFound(String),
}
