use bootenv_backend::Properties;
use std::collections::HashMap;

/// Per-dataset property overrides applied when clones are created.
///
/// Keys are not checked against the backend here; an unknown property only
/// fails once a clone is created with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyContext {
    overrides: HashMap<String, Properties>,
}

impl PropertyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one override for `dataset`.
    pub fn set(&mut self, dataset: &str, key: &str, value: &str) {
        self.overrides
            .entry(dataset.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    /// Drop every override registered for `dataset`.
    pub fn clear(&mut self, dataset: &str) {
        self.overrides.remove(dataset);
    }

    /// Overrides registered for `dataset`; empty when none are.
    pub fn resolve(&self, dataset: &str) -> Properties {
        self.overrides.get(dataset).cloned().unwrap_or_default()
    }

    /// Overwrite `props` key by key with the overrides for `dataset`. Keys
    /// without an override pass through unchanged.
    pub fn apply(&self, dataset: &str, props: &mut Properties) {
        if let Some(overrides) = self.overrides.get(dataset) {
            props.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Number of datasets with overrides.
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.overrides.keys().map(String::as_str)
    }
}
