//! Recursive snapshot-and-clone of a boot environment.
//!
//! A deep clone materializes the source subtree once (names and local
//! properties, depth-first, root first, children in the backend's enumeration
//! order), then creates one clone per node in that order. Every dataset the
//! call creates is pushed on a rollback stack; on failure the stack is
//! destroyed in reverse so the pool ends up as it was before the call.

use crate::concurrency::JournalLock;
use crate::error::{BeError, BeErrorKind};
use crate::handle::{unique_snapshot_name, Handle};
use crate::naming;
use crate::props::PropertyContext;
use bootenv_backend::{snapshot_name, split_snapshot, DatasetBackend, Properties};
use bootenv_store::{CloneJournal, JournalOpKind, RollbackStep};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters of one deep clone.
#[derive(Debug, Clone, Copy)]
pub struct DeepCloneRequest<'a> {
    source: &'a str,
    destination: &'a str,
    snapshot: Option<&'a str>,
    properties: Option<&'a PropertyContext>,
    depth: Option<usize>,
}

impl<'a> DeepCloneRequest<'a> {
    /// Clone boot environment `source` (a name under the boot-environment
    /// root, or a dataset path) as `destination`.
    pub fn new(source: &'a str, destination: &'a str) -> Self {
        Self {
            source,
            destination,
            snapshot: None,
            properties: None,
            depth: None,
        }
    }

    /// Clone from an existing snapshot (`name` or `dataset@name`) instead of
    /// taking a new one.
    #[must_use]
    pub fn snapshot(mut self, snapshot: &'a str) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn properties(mut self, properties: &'a PropertyContext) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Limit how many levels below the source root are cloned; `0` clones
    /// the root dataset only.
    #[must_use]
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Outcome of a successful deep clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    /// Root dataset of the new boot environment.
    pub destination: String,
    /// Short snapshot name the clones were made from.
    pub snapshot: String,
    /// Whether the snapshot was taken by this call.
    pub snapshot_created: bool,
    /// Created datasets in creation order.
    pub created: Vec<String>,
}

/// One node of the source subtree, ready to be cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CloneNode {
    source: String,
    snapshot: String,
    target: String,
    properties: Properties,
}

/// Datasets created so far by one call, with their journal entry.
struct Rollback<'a> {
    backend: &'a dyn DatasetBackend,
    journal: Option<(&'a CloneJournal, String)>,
    created: Vec<(String, bool)>,
}

impl<'a> Rollback<'a> {
    fn begin(
        backend: &'a dyn DatasetBackend,
        journal: Option<&'a CloneJournal>,
        subject: &str,
    ) -> Result<Self, BeError> {
        let journal = match journal {
            Some(j) => Some((j, j.begin(JournalOpKind::DeepClone, subject)?)),
            None => None,
        };
        Ok(Self {
            backend,
            journal,
            created: Vec::new(),
        })
    }

    /// Journal `name` before it is created.
    fn register(&self, name: &str, recursive: bool) -> Result<(), BeError> {
        if let Some((journal, op_id)) = &self.journal {
            journal.add_rollback_step(
                op_id,
                RollbackStep::DestroyDataset {
                    name: name.to_owned(),
                    recursive,
                },
            )?;
        }
        Ok(())
    }

    fn push(&mut self, name: &str, recursive: bool) {
        self.created.push((name.to_owned(), recursive));
    }

    fn commit(&self) -> Result<(), BeError> {
        if let Some((journal, op_id)) = &self.journal {
            journal.commit(op_id)?;
        }
        Ok(())
    }

    /// Destroy everything created so far, newest first, and produce the error
    /// to report for `cause`.
    fn unwind(self, cause: BeError) -> BeError {
        warn!(
            "deep clone failed ({}); rolling back {} datasets",
            cause.kind(),
            self.created.len()
        );
        let mut leftover = Vec::new();
        for (name, recursive) in self.created.iter().rev() {
            match self.backend.destroy(name, *recursive) {
                Ok(()) => debug!("rollback: destroyed {name}"),
                Err(e) => {
                    warn!("rollback: failed to destroy {name}: {e}");
                    leftover.push(name.clone());
                }
            }
        }
        if !leftover.is_empty() {
            // The journal entry stays so the next recovery retries the cleanup.
            return BeError::partial(cause, leftover);
        }
        if let Err(e) = self.commit() {
            warn!("rollback complete but journal entry could not be removed: {e}");
        }
        cause
    }
}

impl Handle {
    /// Create boot environment `destination` as a deep clone of `source`.
    ///
    /// Either every dataset of the source subtree gets a clone under the
    /// destination, or none of the datasets this call created remain. When
    /// that cleanup itself fails the error kind is `PartialFailure` and
    /// [`BeError::leftover`] lists what is still in the pool.
    pub fn deep_clone(&mut self, request: &DeepCloneRequest<'_>) -> Result<CloneReport, BeError> {
        match self.run_deep_clone(request) {
            Ok(report) => {
                self.clear_error();
                Ok(report)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Deep clone the running boot environment as `name`.
    ///
    /// The new root keeps the source's `mountpoint`; use [`deep_clone`](Self::deep_clone)
    /// with a [`PropertyContext`] to override it.
    pub fn create(&mut self, name: &str) -> Result<CloneReport, BeError> {
        let source = self.active_root().to_owned();
        self.deep_clone(&DeepCloneRequest::new(&source, name))
    }

    fn run_deep_clone(&mut self, request: &DeepCloneRequest<'_>) -> Result<CloneReport, BeError> {
        naming::validate_be_name(request.destination)?;
        let dest_root = self.be_dataset(request.destination);
        naming::check_dataset_len(&dest_root)?;

        let backend = Arc::clone(&self.conn.backend);
        let backend = backend.as_ref();

        if backend
            .exists(&dest_root)
            .map_err(|e| BeError::backend(e, format!("cannot open {dest_root}")))?
        {
            return Err(BeError::new(
                BeErrorKind::Exists,
                format!("boot environment {} already exists", request.destination),
            ));
        }

        self.refresh_pool()?;

        if request.source.contains('@') {
            return Err(BeError::new(
                BeErrorKind::InvalidName,
                format!("source {} must be a dataset, not a snapshot", request.source),
            ));
        }
        let source_root = self.be_dataset(request.source);
        if !backend
            .exists(&source_root)
            .map_err(|e| BeError::backend(e, format!("cannot open {source_root}")))?
        {
            return Err(BeError::new(
                BeErrorKind::NotFound,
                format!("boot environment {} does not exist", request.source),
            ));
        }

        let supplied = match request.snapshot {
            Some(given) => Some(supplied_snapshot(backend, &source_root, given)?),
            None => None,
        };

        info!("deep clone {source_root} -> {dest_root}");
        // Held until the journal entry is committed or the clone is unwound.
        let _lock = match &self.state {
            Some(state) => {
                let lock = JournalLock::acquire(&state.layout)?;
                let recovered = state.journal.recover(backend)?;
                if recovered > 0 {
                    info!("rolled back {recovered} interrupted clones before {dest_root}");
                }
                Some(lock)
            }
            None => None,
        };
        let journal = self.state.as_ref().map(|state| &state.journal);
        let mut rollback = Rollback::begin(backend, journal, &dest_root)?;

        let (snap, snapshot_created) = match supplied {
            Some(snap) => (snap, false),
            None => match take_snapshot(backend, &rollback, &source_root) {
                Ok(snap) => {
                    rollback.push(&snapshot_name(&source_root, &snap), true);
                    (snap, true)
                }
                Err(e) => return Err(rollback.unwind(e)),
            },
        };

        let nodes = match materialize(backend, &source_root, &dest_root, &snap, request) {
            Ok(nodes) => nodes,
            Err(e) => return Err(rollback.unwind(e)),
        };

        for node in &nodes {
            if let Err(e) = rollback.register(&node.target, false) {
                return Err(rollback.unwind(e));
            }
            debug!("cloning {} -> {}", node.snapshot, node.target);
            if let Err(e) = backend.clone_snapshot(&node.snapshot, &node.target, &node.properties)
            {
                let cause = BeError::backend(
                    e,
                    format!("cannot clone {} to {}", node.snapshot, node.target),
                );
                return Err(rollback.unwind(cause));
            }
            rollback.push(&node.target, false);
        }

        if let Err(e) = rollback.commit() {
            return Err(rollback.unwind(e));
        }

        info!(
            "created boot environment {dest_root} ({} datasets) from @{snap}",
            nodes.len()
        );
        Ok(CloneReport {
            destination: dest_root,
            snapshot: snap,
            snapshot_created,
            created: nodes.into_iter().map(|n| n.target).collect(),
        })
    }
}

/// Validate a caller-supplied snapshot against the source root and return its
/// short name.
fn supplied_snapshot(
    backend: &dyn DatasetBackend,
    source_root: &str,
    given: &str,
) -> Result<String, BeError> {
    let short = match split_snapshot(given) {
        Some((dataset, short)) if dataset == source_root => short,
        Some((dataset, _)) => {
            return Err(BeError::new(
                BeErrorKind::NotFound,
                format!("snapshot {given} belongs to {dataset}, not {source_root}"),
            ))
        }
        None => given,
    };
    naming::validate_snapshot_name(short)?;
    let full = snapshot_name(source_root, short);
    if !backend
        .exists(&full)
        .map_err(|e| BeError::backend(e, format!("cannot open {full}")))?
    {
        return Err(BeError::new(
            BeErrorKind::NotFound,
            format!("snapshot {full} does not exist"),
        ));
    }
    Ok(short.to_owned())
}

/// Take a recursive snapshot of the source subtree under a fresh name.
fn take_snapshot(
    backend: &dyn DatasetBackend,
    rollback: &Rollback<'_>,
    source_root: &str,
) -> Result<String, BeError> {
    let snap = unique_snapshot_name(backend, source_root)?;
    let full = snapshot_name(source_root, &snap);
    naming::check_dataset_len(&full)?;
    rollback.register(&full, true)?;
    backend
        .snapshot(&full, true)
        .map_err(|e| BeError::backend(e, format!("cannot create snapshot {full}")))?;
    debug!("created recursive snapshot {full}");
    Ok(snap)
}

/// Enumerate the subtree below `source_root` into clone nodes, depth-first
/// with the root first and children in backend order.
fn materialize(
    backend: &dyn DatasetBackend,
    source_root: &str,
    dest_root: &str,
    snap: &str,
    request: &DeepCloneRequest<'_>,
) -> Result<Vec<CloneNode>, BeError> {
    let mut nodes = Vec::new();
    let mut stack = vec![(source_root.to_owned(), 0usize)];

    while let Some((dataset, level)) = stack.pop() {
        let snapshot = snapshot_name(&dataset, snap);
        if !backend
            .exists(&snapshot)
            .map_err(|e| BeError::backend(e, format!("cannot open {snapshot}")))?
        {
            return Err(BeError::new(
                BeErrorKind::NotFound,
                format!("snapshot {snapshot} does not exist"),
            ));
        }

        let target = naming::rewrite_prefix(&dataset, source_root, dest_root).ok_or_else(|| {
            BeError::new(
                BeErrorKind::NotFound,
                format!("{dataset} is outside {source_root}"),
            )
        })?;
        naming::check_dataset_len(&target)?;

        let mut properties = backend
            .local_properties(&dataset)
            .map_err(|e| BeError::backend(e, format!("cannot read properties of {dataset}")))?;
        if let Some(ctx) = request.properties {
            ctx.apply(&dataset, &mut properties);
            ctx.apply(&target, &mut properties);
        }

        if !request.depth.is_some_and(|max| level >= max) {
            let children = backend
                .children(&dataset)
                .map_err(|e| BeError::backend(e, format!("cannot list children of {dataset}")))?;
            stack.extend(children.into_iter().rev().map(|child| (child, level + 1)));
        }

        nodes.push(CloneNode {
            source: dataset,
            snapshot,
            target,
            properties,
        });
    }

    debug!(
        "materialized {} datasets under {source_root}: {:?}",
        nodes.len(),
        nodes.iter().map(|n| n.source.as_str()).collect::<Vec<_>>()
    );
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HandleConfig;
    use bootenv_backend::{BackendError, BackendOp, MemoryBackend};

    fn tree() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_pool("zroot");
        backend.create_dataset("zroot/ROOT", &[]);
        backend.create_dataset("zroot/ROOT/default", &[("mountpoint", "/")]);
        backend.create_dataset("zroot/ROOT/default/var", &[("atime", "off")]);
        backend.create_dataset("zroot/ROOT/default/var/log", &[]);
        backend.create_dataset("zroot/ROOT/default/usr", &[("compression", "lz4")]);
        backend.set_root_dataset("zroot/ROOT/default");
        backend
    }

    fn open(backend: &Arc<MemoryBackend>) -> Handle {
        Handle::open_with_backend(backend.clone(), &HandleConfig::default()).unwrap()
    }

    #[test]
    fn materialize_is_preorder_in_backend_order() {
        let backend = tree();
        backend.snapshot("zroot/ROOT/default@s", true).unwrap();
        let request = DeepCloneRequest::new("default", "be2");
        let nodes = materialize(
            backend.as_ref(),
            "zroot/ROOT/default",
            "zroot/ROOT/be2",
            "s",
            &request,
        )
        .unwrap();
        let sources: Vec<&str> = nodes.iter().map(|n| n.source.as_str()).collect();
        assert_eq!(
            sources,
            vec![
                "zroot/ROOT/default",
                "zroot/ROOT/default/var",
                "zroot/ROOT/default/var/log",
                "zroot/ROOT/default/usr",
            ]
        );
        assert_eq!(nodes[2].target, "zroot/ROOT/be2/var/log");
        assert_eq!(nodes[2].snapshot, "zroot/ROOT/default/var/log@s");
    }

    #[test]
    fn materialize_respects_depth() {
        let backend = tree();
        backend.snapshot("zroot/ROOT/default@s", true).unwrap();
        let request = DeepCloneRequest::new("default", "be2").depth(1);
        let nodes = materialize(
            backend.as_ref(),
            "zroot/ROOT/default",
            "zroot/ROOT/be2",
            "s",
            &request,
        )
        .unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| !n.source.ends_with("/log")));
    }

    #[test]
    fn materialize_merges_source_then_destination_overrides() {
        let backend = tree();
        backend.snapshot("zroot/ROOT/default@s", true).unwrap();
        let mut ctx = PropertyContext::new();
        ctx.set("zroot/ROOT/default/usr", "compression", "zstd");
        ctx.set("zroot/ROOT/default/usr", "atime", "on");
        ctx.set("zroot/ROOT/be2/usr", "atime", "off");
        let request = DeepCloneRequest::new("default", "be2").properties(&ctx);
        let nodes = materialize(
            backend.as_ref(),
            "zroot/ROOT/default",
            "zroot/ROOT/be2",
            "s",
            &request,
        )
        .unwrap();
        let usr = nodes.iter().find(|n| n.target == "zroot/ROOT/be2/usr").unwrap();
        assert_eq!(usr.properties["compression"], "zstd");
        assert_eq!(usr.properties["atime"], "off");
    }

    #[test]
    fn missing_descendant_snapshot_is_not_found() {
        let backend = tree();
        backend.snapshot("zroot/ROOT/default@s", false).unwrap();
        let mut handle = open(&backend);
        let err = handle
            .deep_clone(&DeepCloneRequest::new("default", "be2").snapshot("s"))
            .unwrap_err();
        assert_eq!(err.kind(), BeErrorKind::NotFound);
        assert!(!backend.exists("zroot/ROOT/be2").unwrap());
        // Supplied snapshots are never destroyed by rollback.
        assert!(backend.exists("zroot/ROOT/default@s").unwrap());
    }

    #[test]
    fn supplied_snapshot_accepts_full_name() {
        let backend = tree();
        backend.snapshot("zroot/ROOT/default@s", true).unwrap();
        let mut handle = open(&backend);
        let report = handle
            .deep_clone(&DeepCloneRequest::new("default", "be2").snapshot("zroot/ROOT/default@s"))
            .unwrap();
        assert_eq!(report.snapshot, "s");
        assert!(!report.snapshot_created);
        assert_eq!(report.created.len(), 4);
    }

    #[test]
    fn supplied_snapshot_of_other_dataset_is_not_found() {
        let backend = tree();
        let mut handle = open(&backend);
        let err = handle
            .deep_clone(&DeepCloneRequest::new("default", "be2").snapshot("zroot/ROOT@s"))
            .unwrap_err();
        assert_eq!(err.kind(), BeErrorKind::NotFound);
    }

    #[test]
    fn snapshot_source_is_rejected() {
        let backend = tree();
        let mut handle = open(&backend);
        let err = handle
            .deep_clone(&DeepCloneRequest::new("default@s", "be2"))
            .unwrap_err();
        assert_eq!(err.kind(), BeErrorKind::InvalidName);
    }

    #[test]
    fn invalid_destination_makes_no_backend_calls() {
        let backend = tree();
        let mut handle = open(&backend);
        backend.clear_calls();
        let err = handle
            .deep_clone(&DeepCloneRequest::new("default", "be/2"))
            .unwrap_err();
        assert_eq!(err.kind(), BeErrorKind::InvalidName);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn permission_denied_during_walk_fails_fast() {
        let backend = tree();
        let mut handle = open(&backend);
        backend.inject_fault(
            BackendOp::LocalProperties,
            "zroot/ROOT/default/var",
            BackendError::PermissionDenied("zroot/ROOT/default/var".into()),
        );
        let err = handle
            .deep_clone(&DeepCloneRequest::new("default", "be2"))
            .unwrap_err();
        assert_eq!(err.kind(), BeErrorKind::PermissionDenied);
        assert!(!backend.exists("zroot/ROOT/be2").unwrap());
        // The snapshot taken by the call is gone too.
        assert!(backend.snapshots().is_empty());
    }

    #[test]
    fn failed_snapshot_cleanup_is_partial_failure() {
        let backend = tree();
        let mut handle = open(&backend);
        backend.inject_fault(
            BackendOp::Clone,
            "zroot/ROOT/be2",
            BackendError::Unavailable("lost".into()),
        );
        let snapshot_fault = |name: &str| {
            backend.inject_fault(
                BackendOp::Destroy,
                name,
                BackendError::PermissionDenied(name.into()),
            );
        };
        // The snapshot name is not known ahead of time; fault every candidate
        // the call can pick in the current second.
        let base = chrono::Local::now().format("%Y-%m-%d-%H:%M:%S").to_string();
        snapshot_fault(&format!("zroot/ROOT/default@{base}"));

        match handle.deep_clone(&DeepCloneRequest::new("default", "be2")) {
            Err(err) if err.kind() == BeErrorKind::PartialFailure => {
                assert_eq!(err.original_kind(), Some(BeErrorKind::Unavailable));
                assert_eq!(err.leftover(), [format!("zroot/ROOT/default@{base}")]);
            }
            // The clock ticked between computing `base` and the call.
            Err(err) => assert_eq!(err.kind(), BeErrorKind::Unavailable),
            Ok(report) => panic!("unexpected success: {report:?}"),
        }
    }

    #[test]
    fn create_clones_active_environment() {
        let backend = tree();
        let mut handle = open(&backend);
        let report = handle.create("upgrade").unwrap();
        assert_eq!(report.destination, "zroot/ROOT/upgrade");
        assert!(report.snapshot_created);
        assert_eq!(
            report.created,
            vec![
                "zroot/ROOT/upgrade",
                "zroot/ROOT/upgrade/var",
                "zroot/ROOT/upgrade/var/log",
                "zroot/ROOT/upgrade/usr",
            ]
        );
    }

    #[test]
    fn success_clears_stale_error() {
        let backend = tree();
        let mut handle = open(&backend);
        assert!(handle.exists("x/y").is_err());
        assert!(handle.last_error_kind().is_some());
        handle
            .deep_clone(&DeepCloneRequest::new("default", "be2"))
            .unwrap();
        assert_eq!(handle.last_error_kind(), None);
    }
}
