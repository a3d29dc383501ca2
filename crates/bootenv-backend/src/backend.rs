use crate::BackendError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property name/value pairs as the backend reports or accepts them.
pub type Properties = BTreeMap<String, String>;

/// Reference to an imported pool. The guid distinguishes a re-imported pool
/// from the instance the reference was taken against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolRef {
    pub name: String,
    pub guid: u64,
}

pub trait DatasetBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the backend connection. Fails with `Unavailable` when the
    /// pool tooling cannot be reached.
    fn connect(&self) -> Result<(), BackendError>;

    /// Release the connection taken by [`connect`](Self::connect).
    fn disconnect(&self) {}

    /// The dataset currently mounted at `/`.
    fn root_dataset(&self) -> Result<String, BackendError>;

    /// The pool's `bootfs` property, `None` when unset.
    fn pool_bootfs(&self, pool: &str) -> Result<Option<String>, BackendError>;

    fn open_pool(&self, pool: &str) -> Result<PoolRef, BackendError>;

    /// Whether `pool` still refers to the imported instance it was opened against.
    fn pool_is_open(&self, pool: &PoolRef) -> bool;

    /// Whether a dataset or `dataset@snapshot` exists.
    fn exists(&self, name: &str) -> Result<bool, BackendError>;

    /// Direct filesystem children of `name`, in the backend's enumeration order.
    fn children(&self, name: &str) -> Result<Vec<String>, BackendError>;

    /// Properties set locally on `name` (not inherited, not defaults).
    fn local_properties(&self, name: &str) -> Result<Properties, BackendError>;

    /// Create `dataset@snap`; `recursive` snapshots every descendant under the
    /// same snapshot name in one operation.
    fn snapshot(&self, snapshot: &str, recursive: bool) -> Result<(), BackendError>;

    fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &Properties,
    ) -> Result<(), BackendError>;

    fn destroy(&self, name: &str, recursive: bool) -> Result<(), BackendError>;
}

pub fn select_backend(
    name: &str,
    zfs_command: &str,
    zpool_command: &str,
) -> Result<Box<dyn DatasetBackend>, BackendError> {
    match name {
        "zfs" => Ok(Box::new(crate::zfs::ZfsBackend::with_commands(
            zfs_command,
            zpool_command,
        ))),
        "memory" => Ok(Box::new(crate::memory::MemoryBackend::new())),
        other => Err(BackendError::Unavailable(format!(
            "unknown backend '{other}'"
        ))),
    }
}

/// Join a dataset and snapshot name as `dataset@snap`.
pub fn snapshot_name(dataset: &str, snap: &str) -> String {
    format!("{dataset}@{snap}")
}

/// Split `dataset@snap` into its parts. Returns `None` for plain dataset names.
pub fn split_snapshot(name: &str) -> Option<(&str, &str)> {
    name.split_once('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_backends() {
        assert!(select_backend("zfs", "zfs", "zpool").is_ok());
        assert!(select_backend("memory", "zfs", "zpool").is_ok());
    }

    #[test]
    fn select_invalid_backend_fails() {
        let err = select_backend("btrfs", "zfs", "zpool").err().unwrap();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn snapshot_name_helpers() {
        let full = snapshot_name("zroot/ROOT/default", "2024-01-01-00:00:00");
        assert_eq!(full, "zroot/ROOT/default@2024-01-01-00:00:00");
        assert_eq!(
            split_snapshot(&full),
            Some(("zroot/ROOT/default", "2024-01-01-00:00:00"))
        );
        assert_eq!(split_snapshot("zroot/ROOT/default"), None);
    }
}
