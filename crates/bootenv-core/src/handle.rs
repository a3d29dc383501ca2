use crate::concurrency::JournalLock;
use crate::config::HandleConfig;
use crate::error::{BeError, BeErrorKind, DiagnosticSink, StderrSink};
use crate::naming::{self, MAX_PATH_LEN};
use bootenv_backend::{select_backend, snapshot_name, BackendError, DatasetBackend, PoolRef};
use bootenv_store::{CloneJournal, StateLayout};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backend connection owned by a handle; released when dropped.
pub(crate) struct Connection {
    pub(crate) backend: Arc<dyn DatasetBackend>,
}

impl Connection {
    fn acquire(backend: Arc<dyn DatasetBackend>) -> Result<Self, BackendError> {
        backend.connect()?;
        debug!("connected to {} backend", backend.name());
        Ok(Self { backend })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.backend.disconnect();
        debug!("released {} backend connection", self.backend.name());
    }
}

/// The clone journal of a configured state directory.
pub(crate) struct StateDir {
    pub(crate) layout: StateLayout,
    pub(crate) journal: CloneJournal,
}

impl StateDir {
    fn open(dir: &std::path::Path) -> Result<Self, BeError> {
        let layout = StateLayout::new(dir);
        layout.initialize()?;
        let journal = CloneJournal::new(&layout);
        Ok(Self { layout, journal })
    }

    /// Roll back entries of clones that are no longer running. Skipped while a
    /// clone holds the journal lock.
    fn recover_if_idle(&self, backend: &dyn DatasetBackend) -> Result<usize, BeError> {
        match JournalLock::try_acquire(&self.layout)? {
            Some(_lock) => Ok(self.journal.recover(backend)?),
            None => {
                debug!("clone in flight; skipping journal recovery");
                Ok(0)
            }
        }
    }
}

/// A session against one pool's boot environments.
///
/// Operations take `&mut self`: the handle caches the pool reference and
/// records the last failure, so concurrent callers need one handle each or
/// external serialization.
pub struct Handle {
    pub(crate) conn: Connection,
    pool: Option<PoolRef>,
    pool_name: String,
    be_root: String,
    rootfs: String,
    bootfs: String,
    last_error: Option<(BeErrorKind, String)>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
    pub(crate) state: Option<StateDir>,
}

fn check_path(what: &str, path: &str) -> Result<(), BeError> {
    if path.len() > MAX_PATH_LEN {
        return Err(BeError::new(
            BeErrorKind::InvalidName,
            format!("{what} exceeds {MAX_PATH_LEN} bytes: {path}"),
        ));
    }
    Ok(())
}

impl Handle {
    /// Open a handle using the system configuration, optionally restricted
    /// to `pool_hint`.
    pub fn open(pool_hint: Option<&str>) -> Result<Self, BeError> {
        let mut config = HandleConfig::load_default().map_err(|e| {
            BeError::new(
                BeErrorKind::Unavailable,
                format!("cannot load configuration: {e}"),
            )
        })?;
        if let Some(pool) = pool_hint {
            config.pool = Some(pool.to_owned());
        }
        Self::open_with_config(&config)
    }

    pub fn open_with_config(config: &HandleConfig) -> Result<Self, BeError> {
        let backend = select_backend(&config.backend, &config.zfs_command, &config.zpool_command)
            .map_err(|e| BeError::backend(e, "cannot select backend"))?;
        Self::open_with_backend(Arc::from(backend), config)
    }

    pub fn open_with_backend(
        backend: Arc<dyn DatasetBackend>,
        config: &HandleConfig,
    ) -> Result<Self, BeError> {
        Self::resolve(backend, config).inspect_err(|e| {
            warn!("open failed: {e}");
            if config.print_on_error {
                StderrSink.emit(e);
            }
        })
    }

    fn resolve(backend: Arc<dyn DatasetBackend>, config: &HandleConfig) -> Result<Self, BeError> {
        let conn = Connection::acquire(backend)
            .map_err(|e| BeError::new(BeErrorKind::Unavailable, format!("cannot connect: {e}")))?;
        let backend = Arc::clone(&conn.backend);

        let rootfs = match backend.root_dataset() {
            Ok(name) => name,
            Err(BackendError::NotFound(_)) => {
                return Err(BeError::new(
                    BeErrorKind::Unavailable,
                    "root filesystem is not backed by a dataset",
                ))
            }
            Err(e) => return Err(BeError::backend(e, "cannot locate root dataset")),
        };

        let root_pool = naming::pool_of(&rootfs);
        let pool_name = config
            .pool
            .clone()
            .unwrap_or_else(|| root_pool.to_owned());
        let be_root = match &config.be_root {
            Some(root) => root.clone(),
            None => match naming::parent_of(&rootfs) {
                Some(parent) if root_pool == pool_name => parent.to_owned(),
                _ => format!("{pool_name}/ROOT"),
            },
        };
        check_path("boot environment root", &be_root)?;
        check_path("root dataset", &rootfs)?;

        let found = backend
            .exists(&be_root)
            .map_err(|e| BeError::backend(e, format!("cannot open {be_root}")))?;
        if !found {
            return Err(BeError::new(
                BeErrorKind::NotFound,
                format!("boot environment root {be_root} does not exist"),
            ));
        }

        let pool = backend.open_pool(&pool_name).map_err(|e| {
            BeError::new(
                BeErrorKind::Unavailable,
                format!("cannot open pool {pool_name}: {e}"),
            )
        })?;
        let bootfs = backend
            .pool_bootfs(&pool_name)
            .map_err(|e| BeError::backend(e, format!("cannot read bootfs of {pool_name}")))?
            .unwrap_or_else(|| rootfs.clone());
        check_path("boot dataset", &bootfs)?;

        let state = match &config.state_dir {
            Some(dir) => {
                let state = StateDir::open(dir)?;
                state.recover_if_idle(backend.as_ref())?;
                Some(state)
            }
            None => None,
        };

        info!("opened pool {pool_name}: root {be_root}, active {rootfs}, bootfs {bootfs}");

        Ok(Self {
            conn,
            pool: Some(pool),
            pool_name,
            be_root,
            rootfs,
            bootfs,
            last_error: None,
            diagnostics: config
                .print_on_error
                .then(|| Arc::new(StderrSink) as Arc<dyn DiagnosticSink>),
            state,
        })
    }

    pub fn backend(&self) -> &dyn DatasetBackend {
        self.conn.backend.as_ref()
    }

    /// Dataset under which boot environments live.
    pub fn be_root(&self) -> &str {
        &self.be_root
    }

    /// Dataset mounted at `/`.
    pub fn active_root(&self) -> &str {
        &self.rootfs
    }

    /// Dataset the loader boots from.
    pub fn boot_fs(&self) -> &str {
        &self.bootfs
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Name of the running boot environment, or the full root dataset if it
    /// does not live under the boot-environment root.
    pub fn active_be_name(&self) -> &str {
        self.rootfs
            .strip_prefix(&self.be_root)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.contains('/'))
            .unwrap_or(&self.rootfs)
    }

    /// The cached pool reference, re-resolved first if the pool it refers to
    /// is no longer open.
    pub fn active_pool(&mut self) -> Result<PoolRef, BeError> {
        let result = self.refresh_pool();
        result.map_err(|e| self.fail(e))
    }

    pub(crate) fn refresh_pool(&mut self) -> Result<PoolRef, BeError> {
        let current = match self.pool.take() {
            Some(pool) if self.conn.backend.pool_is_open(&pool) => pool,
            stale => {
                if stale.is_some() {
                    debug!("pool reference for {} is stale", self.pool_name);
                }
                self.conn.backend.open_pool(&self.pool_name).map_err(|e| {
                    BeError::new(
                        BeErrorKind::Unavailable,
                        format!("pool {} is unavailable: {e}", self.pool_name),
                    )
                })?
            }
        };
        Ok(self.pool.insert(current).clone())
    }

    pub fn set_print_on_error(&mut self, enabled: bool) {
        self.diagnostics = enabled.then(|| Arc::new(StderrSink) as Arc<dyn DiagnosticSink>);
    }

    /// Route diagnostics to `sink` instead of standard error.
    pub fn set_diagnostics(&mut self, sink: Arc<dyn DiagnosticSink>) {
        self.diagnostics = Some(sink);
    }

    pub fn diagnostics_enabled(&self) -> bool {
        self.diagnostics.is_some()
    }

    /// Kind of the most recent failure. Stale across successful calls other
    /// than [`deep_clone`](Self::deep_clone); check each call's result.
    pub fn last_error_kind(&self) -> Option<BeErrorKind> {
        self.last_error.as_ref().map(|(kind, _)| *kind)
    }

    pub fn last_error_message(&self) -> Option<&str> {
        self.last_error.as_ref().map(|(_, msg)| msg.as_str())
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Record `err` in the error slot, emit it to the diagnostic sink, and
    /// hand it back for returning.
    pub(crate) fn fail(&mut self, err: BeError) -> BeError {
        debug!("operation failed ({}): {err}", err.kind());
        self.last_error = Some((err.kind(), err.message().to_owned()));
        if let Some(sink) = &self.diagnostics {
            sink.emit(&err);
        }
        err
    }

    /// Dataset for a boot-environment name or path.
    pub fn be_dataset(&self, name: &str) -> String {
        naming::root_concat(&self.be_root, name)
    }

    pub fn exists(&mut self, name: &str) -> Result<bool, BeError> {
        let result = naming::validate_be_name(name).and_then(|()| {
            let dataset = self.be_dataset(name);
            self.conn
                .backend
                .exists(&dataset)
                .map_err(|e| BeError::backend(e, format!("cannot open {dataset}")))
        });
        result.map_err(|e| self.fail(e))
    }

    /// Snapshot a boot environment. Without a name, one is generated from the
    /// current time. Returns the full `dataset@snapshot` name.
    pub fn snapshot(
        &mut self,
        source: &str,
        name: Option<&str>,
        recursive: bool,
    ) -> Result<String, BeError> {
        let result = self.take_snapshot(source, name, recursive);
        result.map_err(|e| self.fail(e))
    }

    fn take_snapshot(
        &self,
        source: &str,
        name: Option<&str>,
        recursive: bool,
    ) -> Result<String, BeError> {
        let dataset = self.be_dataset(source);
        let backend = self.backend();
        let found = backend
            .exists(&dataset)
            .map_err(|e| BeError::backend(e, format!("cannot open {dataset}")))?;
        if !found {
            return Err(BeError::new(
                BeErrorKind::NotFound,
                format!("{dataset} does not exist"),
            ));
        }
        let snap = match name {
            Some(name) => {
                naming::validate_snapshot_name(name)?;
                name.to_owned()
            }
            None => unique_snapshot_name(backend, &dataset)?,
        };
        let full = snapshot_name(&dataset, &snap);
        naming::check_dataset_len(&full)?;
        backend
            .snapshot(&full, recursive)
            .map_err(|e| BeError::backend(e, format!("cannot create snapshot {full}")))?;
        info!("created snapshot {full} (recursive={recursive})");
        Ok(full)
    }
}

/// A time-based snapshot name not yet used on `dataset`; `-N` is appended
/// when the timestamp is taken.
pub(crate) fn unique_snapshot_name(
    backend: &dyn DatasetBackend,
    dataset: &str,
) -> Result<String, BeError> {
    const MAX_ATTEMPTS: u32 = 1000;
    let base = chrono::Local::now().format("%Y-%m-%d-%H:%M:%S").to_string();
    for attempt in 0..MAX_ATTEMPTS {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        let taken = backend
            .exists(&snapshot_name(dataset, &candidate))
            .map_err(|e| BeError::backend(e, format!("cannot inspect snapshots of {dataset}")))?;
        if !taken {
            return Ok(candidate);
        }
    }
    Err(BeError::new(
        BeErrorKind::Exists,
        format!("no free snapshot name for {dataset} at {base}"),
    ))
}
