use crate::layout::StateLayout;
use crate::StoreError;
use bootenv_backend::DatasetBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A single step that undoes part of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Destroy a dataset or snapshot the operation created.
    DestroyDataset { name: String, recursive: bool },
}

/// The type of multi-dataset operation being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOpKind {
    DeepClone,
}

impl std::fmt::Display for JournalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalOpKind::DeepClone => write!(f, "deep-clone"),
        }
    }
}

/// A journal entry for an in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op_id: String,
    pub kind: JournalOpKind,
    pub subject: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Write-ahead log of datasets created by in-flight operations.
///
/// An operation opens an entry before its first side effect, appends a
/// rollback step before each dataset it creates, and commits (removes) the
/// entry once it completes. Entries still present at the next open belong to
/// operations that never finished and are rolled back.
pub struct CloneJournal {
    journal_dir: PathBuf,
}

impl CloneJournal {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            journal_dir: layout.journal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.journal_dir)?;
        Ok(())
    }

    /// Begin a new entry. Returns the op_id.
    pub fn begin(&self, kind: JournalOpKind, subject: &str) -> Result<String, StoreError> {
        let op_id = format!(
            "{}-{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            &blake3::hash(subject.as_bytes()).to_hex()[..8],
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        let entry = JournalEntry {
            op_id: op_id.clone(),
            kind,
            subject: subject.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("journal begin: {kind} for {subject} (op_id={op_id})");
        Ok(op_id)
    }

    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)
    }

    /// Remove an entry after the operation completed or was fully undone.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("journal commit: {op_id}");
        }
        Ok(())
    }

    pub fn list_incomplete(&self) -> Result<Vec<JournalEntry>, StoreError> {
        if !self.journal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.journal_dir)? {
            let path = dir_entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<JournalEntry>(&content) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!("corrupt journal entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                },
                Err(e) => {
                    warn!("unreadable journal entry {}: {e}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back every incomplete entry against `backend`.
    ///
    /// Entries whose steps all succeed are removed; an entry with a failed
    /// step is kept so the next recovery retries it. Returns the number of
    /// entries fully rolled back.
    pub fn recover(&self, backend: &dyn DatasetBackend) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let mut recovered = 0;
        for entry in &entries {
            info!(
                "journal recovery: rolling back {} on {} (op_id={})",
                entry.kind, entry.subject, entry.op_id
            );
            if Self::rollback_entry(entry, backend) {
                self.commit(&entry.op_id)?;
                recovered += 1;
            } else {
                warn!(
                    "journal recovery incomplete for {}; keeping entry {}",
                    entry.subject, entry.op_id
                );
            }
        }
        if recovered > 0 {
            info!("journal recovery complete: {recovered} entries rolled back");
        }
        Ok(recovered)
    }

    fn rollback_entry(entry: &JournalEntry, backend: &dyn DatasetBackend) -> bool {
        let mut clean = true;
        for step in entry.rollback_steps.iter().rev() {
            match step {
                RollbackStep::DestroyDataset { name, recursive } => {
                    match backend.exists(name) {
                        Ok(false) => continue,
                        Ok(true) => {}
                        Err(e) => {
                            warn!("journal rollback: cannot check {name}: {e}");
                            clean = false;
                            continue;
                        }
                    }
                    if let Err(e) = backend.destroy(name, *recursive) {
                        warn!("journal rollback: failed to destroy {name}: {e}");
                        clean = false;
                    } else {
                        debug!("journal rollback: destroyed {name}");
                    }
                }
            }
        }
        clean
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.journal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.journal_dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.journal_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.entry_path(&entry.op_id))
            .map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.journal_dir)?;
        Ok(())
    }

    fn read_entry(&self, op_id: &str) -> Result<JournalEntry, StoreError> {
        let path = self.entry_path(op_id);
        if !path.exists() {
            return Err(StoreError::EntryNotFound(op_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
