//! Boot-environment management on top of a [`DatasetBackend`](bootenv_backend::DatasetBackend).
//!
//! A [`Handle`] is opened against one pool and resolves where boot
//! environments live. [`Handle::deep_clone`] creates a new boot environment
//! from a recursive snapshot of an existing one, all or nothing. Failures are
//! returned as [`BeError`] and also recorded on the handle and sent to its
//! [`DiagnosticSink`].
//!
//! A clone copies each source dataset's locally set properties, so cloning the
//! running environment also copies `mountpoint=/`. Register `canmount=noauto`
//! (and a `mountpoint` if needed) for the destination root in a
//! [`PropertyContext`] unless the new environment should mount over `/` the
//! next time datasets are mounted.

pub mod clone;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod handle;
pub mod naming;
pub mod props;

pub use clone::{CloneReport, DeepCloneRequest};
pub use concurrency::JournalLock;
pub use config::{ConfigError, HandleConfig, DEFAULT_CONFIG_PATH};
pub use error::{BeError, BeErrorKind, DiagnosticSink, StderrSink};
pub use handle::Handle;
pub use props::PropertyContext;
