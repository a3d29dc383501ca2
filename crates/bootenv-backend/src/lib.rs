//! Storage backends for bootenv.
//!
//! This crate defines the narrow interface the boot-environment engine consumes
//! from a copy-on-write pool: the `DatasetBackend` trait, a `ZfsBackend` that
//! drives the `zfs`/`zpool` tools, and a `MemoryBackend` that models a pool in
//! memory with fault injection for tests.

pub mod backend;
pub mod memory;
pub mod zfs;

pub use backend::{
    select_backend, snapshot_name, split_snapshot, DatasetBackend, PoolRef, Properties,
};
pub use memory::{BackendCall, BackendOp, MemoryBackend};
pub use zfs::ZfsBackend;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset does not exist: {0}")]
    NotFound(String),
    #[error("dataset already exists: {0}")]
    Exists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("property '{property}' rejected for {name}")]
    BadProperty { name: String, property: String },
    #[error("backend command failed: {0}")]
    CommandFailed(String),
}
