use crate::backend::{split_snapshot, DatasetBackend, PoolRef, Properties};
use crate::BackendError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

const NATIVE_PROPERTIES: &[&str] = &[
    "mountpoint",
    "canmount",
    "compression",
    "atime",
    "readonly",
    "quota",
    "refquota",
    "reservation",
    "recordsize",
    "checksum",
    "exec",
    "setuid",
    "devices",
    "xattr",
    "acltype",
    "relatime",
    "sync",
    "copies",
    "snapdir",
    "dedup",
];

/// Backend operation, used to target injected faults and to record calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    RootDataset,
    PoolBootfs,
    OpenPool,
    Exists,
    Children,
    LocalProperties,
    Snapshot,
    Clone,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub op: BackendOp,
    pub target: String,
}

struct Pool {
    guid: u64,
    imported: bool,
    bootfs: Option<String>,
}

struct Dataset {
    properties: Properties,
    origin: Option<String>,
}

struct Fault {
    op: BackendOp,
    target: String,
    error: BackendError,
}

#[derive(Default)]
struct State {
    unavailable: bool,
    connections: usize,
    next_guid: u64,
    pools: BTreeMap<String, Pool>,
    root: Option<String>,
    /// Dataset names in creation order; this is the enumeration order.
    order: Vec<String>,
    datasets: HashMap<String, Dataset>,
    snapshots: BTreeSet<String>,
    faults: Vec<Fault>,
    calls: Vec<BackendCall>,
}

impl State {
    fn record(&mut self, op: BackendOp, target: &str) -> Result<(), BackendError> {
        self.calls.push(BackendCall {
            op,
            target: target.to_owned(),
        });
        if self.unavailable {
            return Err(BackendError::Unavailable("connection lost".to_owned()));
        }
        if let Some(pos) = self
            .faults
            .iter()
            .position(|f| f.op == op && f.target == target)
        {
            return Err(self.faults.remove(pos).error);
        }
        Ok(())
    }

    /// A dataset outside `doomed` cloned from one of `snapshots`.
    fn dependent_clone(&self, snapshots: &[String], doomed: &[String]) -> Option<(&str, &str)> {
        self.datasets.iter().find_map(|(name, ds)| {
            let origin = ds.origin.as_deref()?;
            (snapshots.iter().any(|s| s == origin) && !doomed.contains(name))
                .then_some((origin, name.as_str()))
        })
    }

    fn descendants(&self, root: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| is_within(name, root))
            .cloned()
            .collect()
    }
}

fn is_within(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn parent(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(p, _)| p)
}

fn valid_property(key: &str) -> bool {
    NATIVE_PROPERTIES.contains(&key) || (key.contains(':') && !key.starts_with(':'))
}

/// A pool modelled in memory.
///
/// Datasets enumerate in creation order. Faults injected with
/// [`inject_fault`](Self::inject_fault) fire once, on the first matching call.
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_guid: 1,
                ..State::default()
            }),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Import a pool and create its top-level dataset.
    pub fn add_pool(&self, name: &str) -> u64 {
        let mut state = self.state();
        let guid = state.next_guid;
        state.next_guid += 1;
        state.pools.insert(
            name.to_owned(),
            Pool {
                guid,
                imported: true,
                bootfs: None,
            },
        );
        if !state.datasets.contains_key(name) {
            state.order.push(name.to_owned());
            state.datasets.insert(
                name.to_owned(),
                Dataset {
                    properties: Properties::new(),
                    origin: None,
                },
            );
        }
        guid
    }

    pub fn create_dataset(&self, name: &str, properties: &[(&str, &str)]) {
        let mut state = self.state();
        let properties = properties
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        if state.datasets.contains_key(name) {
            if let Some(ds) = state.datasets.get_mut(name) {
                ds.properties = properties;
            }
            return;
        }
        state.order.push(name.to_owned());
        state.datasets.insert(
            name.to_owned(),
            Dataset {
                properties,
                origin: None,
            },
        );
    }

    pub fn set_root_dataset(&self, name: &str) {
        self.state().root = Some(name.to_owned());
    }

    pub fn set_bootfs(&self, pool: &str, bootfs: Option<&str>) {
        if let Some(p) = self.state().pools.get_mut(pool) {
            p.bootfs = bootfs.map(str::to_owned);
        }
    }

    pub fn export_pool(&self, pool: &str) {
        if let Some(p) = self.state().pools.get_mut(pool) {
            p.imported = false;
        }
    }

    /// Re-import a pool. The new import gets a fresh guid, so references taken
    /// against the previous import become stale.
    pub fn import_pool(&self, pool: &str) {
        let mut state = self.state();
        let guid = state.next_guid;
        state.next_guid += 1;
        if let Some(p) = state.pools.get_mut(pool) {
            p.imported = true;
            p.guid = guid;
        }
    }

    /// Simulate losing (`false`) or regaining (`true`) the backend connection.
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    pub fn inject_fault(&self, op: BackendOp, target: &str, error: BackendError) {
        self.state().faults.push(Fault {
            op,
            target: target.to_owned(),
            error,
        });
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// All dataset names in enumeration order.
    pub fn datasets(&self) -> Vec<String> {
        self.state().order.clone()
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.state().snapshots.iter().cloned().collect()
    }

    pub fn properties(&self, name: &str) -> Option<Properties> {
        self.state()
            .datasets
            .get(name)
            .map(|ds| ds.properties.clone())
    }

    /// The snapshot a clone was created from.
    pub fn origin(&self, name: &str) -> Option<String> {
        self.state()
            .datasets
            .get(name)
            .and_then(|ds| ds.origin.clone())
    }
}

impl DatasetBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(&self) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(BackendError::Unavailable("connection refused".to_owned()));
        }
        state.connections += 1;
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state();
        state.connections = state.connections.saturating_sub(1);
    }

    fn root_dataset(&self) -> Result<String, BackendError> {
        let mut state = self.state();
        state.record(BackendOp::RootDataset, "/")?;
        state
            .root
            .clone()
            .ok_or_else(|| BackendError::NotFound("no dataset mounted at /".to_owned()))
    }

    fn pool_bootfs(&self, pool: &str) -> Result<Option<String>, BackendError> {
        let mut state = self.state();
        state.record(BackendOp::PoolBootfs, pool)?;
        match state.pools.get(pool) {
            Some(p) if p.imported => Ok(p.bootfs.clone()),
            _ => Err(BackendError::Unavailable(format!("pool {pool} is not imported"))),
        }
    }

    fn open_pool(&self, pool: &str) -> Result<PoolRef, BackendError> {
        let mut state = self.state();
        state.record(BackendOp::OpenPool, pool)?;
        match state.pools.get(pool) {
            Some(p) if p.imported => Ok(PoolRef {
                name: pool.to_owned(),
                guid: p.guid,
            }),
            _ => Err(BackendError::Unavailable(format!("pool {pool} is not imported"))),
        }
    }

    fn pool_is_open(&self, pool: &PoolRef) -> bool {
        let state = self.state();
        !state.unavailable
            && state
                .pools
                .get(&pool.name)
                .is_some_and(|p| p.imported && p.guid == pool.guid)
    }

    fn exists(&self, name: &str) -> Result<bool, BackendError> {
        let mut state = self.state();
        state.record(BackendOp::Exists, name)?;
        Ok(state.datasets.contains_key(name) || state.snapshots.contains(name))
    }

    fn children(&self, name: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state();
        state.record(BackendOp::Children, name)?;
        if !state.datasets.contains_key(name) {
            return Err(BackendError::NotFound(name.to_owned()));
        }
        Ok(state
            .order
            .iter()
            .filter(|child| parent(child) == Some(name))
            .cloned()
            .collect())
    }

    fn local_properties(&self, name: &str) -> Result<Properties, BackendError> {
        let mut state = self.state();
        state.record(BackendOp::LocalProperties, name)?;
        state
            .datasets
            .get(name)
            .map(|ds| ds.properties.clone())
            .ok_or_else(|| BackendError::NotFound(name.to_owned()))
    }

    fn snapshot(&self, snapshot: &str, recursive: bool) -> Result<(), BackendError> {
        let mut state = self.state();
        state.record(BackendOp::Snapshot, snapshot)?;
        let Some((dataset, snap)) = split_snapshot(snapshot) else {
            return Err(BackendError::CommandFailed(format!(
                "not a snapshot name: {snapshot}"
            )));
        };
        if !state.datasets.contains_key(dataset) {
            return Err(BackendError::NotFound(dataset.to_owned()));
        }
        let targets = if recursive {
            state.descendants(dataset)
        } else {
            vec![dataset.to_owned()]
        };
        let names: Vec<String> = targets.iter().map(|ds| format!("{ds}@{snap}")).collect();
        if let Some(existing) = names.iter().find(|n| state.snapshots.contains(*n)) {
            return Err(BackendError::Exists(existing.clone()));
        }
        state.snapshots.extend(names);
        Ok(())
    }

    fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &Properties,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        state.record(BackendOp::Clone, target)?;
        if !state.snapshots.contains(snapshot) {
            return Err(BackendError::NotFound(snapshot.to_owned()));
        }
        if state.datasets.contains_key(target) {
            return Err(BackendError::Exists(target.to_owned()));
        }
        match parent(target) {
            Some(p) if state.datasets.contains_key(p) => {}
            _ => {
                return Err(BackendError::NotFound(format!(
                    "parent of {target} does not exist"
                )))
            }
        }
        if let Some(key) = properties.keys().find(|k| !valid_property(k)) {
            return Err(BackendError::BadProperty {
                name: target.to_owned(),
                property: key.clone(),
            });
        }
        state.order.push(target.to_owned());
        state.datasets.insert(
            target.to_owned(),
            Dataset {
                properties: properties.clone(),
                origin: Some(snapshot.to_owned()),
            },
        );
        Ok(())
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<(), BackendError> {
        let mut state = self.state();
        state.record(BackendOp::Destroy, name)?;

        if let Some((dataset, snap)) = split_snapshot(name) {
            let targets: Vec<String> = if recursive {
                state
                    .descendants(dataset)
                    .into_iter()
                    .map(|ds| format!("{ds}@{snap}"))
                    .filter(|s| state.snapshots.contains(s))
                    .collect()
            } else {
                vec![name.to_owned()]
            };
            if targets.is_empty() || !state.snapshots.contains(name) {
                return Err(BackendError::NotFound(name.to_owned()));
            }
            if let Some((origin, clone)) = state.dependent_clone(&targets, &[]) {
                return Err(BackendError::CommandFailed(format!(
                    "cannot destroy '{origin}': snapshot has dependent clones ({clone})"
                )));
            }
            for s in targets {
                state.snapshots.remove(&s);
            }
            return Ok(());
        }

        if !state.datasets.contains_key(name) {
            return Err(BackendError::NotFound(name.to_owned()));
        }
        let doomed = state.descendants(name);
        if !recursive {
            let prefix = format!("{name}@");
            if doomed.len() > 1 || state.snapshots.iter().any(|s| s.starts_with(&prefix)) {
                return Err(BackendError::CommandFailed(format!(
                    "{name} has children; use recursive destroy"
                )));
            }
        }
        let doomed_snapshots: Vec<String> = state
            .snapshots
            .iter()
            .filter(|s| split_snapshot(s).is_some_and(|(ds, _)| doomed.iter().any(|d| d == ds)))
            .cloned()
            .collect();
        if let Some((origin, clone)) = state.dependent_clone(&doomed_snapshots, &doomed) {
            return Err(BackendError::CommandFailed(format!(
                "cannot destroy '{name}': snapshot {origin} has dependent clones ({clone})"
            )));
        }
        for ds in &doomed {
            let prefix = format!("{ds}@");
            state.snapshots.retain(|s| !s.starts_with(&prefix));
            state.datasets.remove(ds);
        }
        state.order.retain(|ds| !doomed.contains(ds));
        Ok(())
    }
}
