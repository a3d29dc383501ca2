//! Boot-environment naming rules and dataset-name arithmetic.

use crate::error::{BeError, BeErrorKind};

/// Capacity of the path strings a handle stores.
pub const MAX_PATH_LEN: usize = 1024;

/// Dataset names (including any `@snapshot` suffix) must be shorter than this.
pub const MAX_DATASET_NAME_LEN: usize = 256;

fn valid_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'))
}

/// A boot-environment name is a single dataset component.
pub fn validate_be_name(name: &str) -> Result<(), BeError> {
    if valid_component(name) {
        Ok(())
    } else {
        Err(BeError::new(
            BeErrorKind::InvalidName,
            format!("invalid boot environment name '{name}': must match [A-Za-z0-9_.:-]"),
        ))
    }
}

pub fn validate_snapshot_name(name: &str) -> Result<(), BeError> {
    if valid_component(name) {
        Ok(())
    } else {
        Err(BeError::new(
            BeErrorKind::InvalidName,
            format!("invalid snapshot name '{name}': must match [A-Za-z0-9_.:-]"),
        ))
    }
}

pub fn check_dataset_len(name: &str) -> Result<(), BeError> {
    if name.len() < MAX_DATASET_NAME_LEN {
        Ok(())
    } else {
        Err(BeError::new(
            BeErrorKind::InvalidName,
            format!("dataset name too long ({} bytes): {name}", name.len()),
        ))
    }
}

/// Resolve a boot-environment name or dataset path. Bare names are placed
/// under `be_root`; anything containing `/` is already a dataset path.
pub fn root_concat(be_root: &str, name: &str) -> String {
    if name.contains('/') {
        name.to_owned()
    } else {
        format!("{be_root}/{name}")
    }
}

/// Substitute the `from` prefix of `dataset` with `to`, keeping the path
/// below it intact. `None` if `dataset` does not lie under `from`.
pub fn rewrite_prefix(dataset: &str, from: &str, to: &str) -> Option<String> {
    if dataset == from {
        return Some(to.to_owned());
    }
    let rest = dataset.strip_prefix(from)?.strip_prefix('/')?;
    Some(format!("{to}/{rest}"))
}

pub fn pool_of(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

pub fn parent_of(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn be_names() {
        assert!(validate_be_name("default").is_ok());
        assert!(validate_be_name("13.2-RELEASE_p1:test").is_ok());
        for bad in ["", ".", "..", "a/b", "a@b", "a b", "a#b"] {
            let err = validate_be_name(bad).unwrap_err();
            assert_eq!(err.kind(), BeErrorKind::InvalidName, "{bad:?}");
        }
    }

    #[test]
    fn snapshot_names() {
        assert!(validate_snapshot_name("2024-01-01-12:00:00").is_ok());
        assert!(validate_snapshot_name("a@b").is_err());
    }

    #[test]
    fn dataset_length_limit() {
        assert!(check_dataset_len(&"a".repeat(255)).is_ok());
        assert!(check_dataset_len(&"a".repeat(256)).is_err());
    }

    #[test]
    fn root_concat_bare_and_full() {
        assert_eq!(root_concat("zroot/ROOT", "be2"), "zroot/ROOT/be2");
        assert_eq!(
            root_concat("zroot/ROOT", "tank/ROOT/other"),
            "tank/ROOT/other"
        );
    }

    #[test]
    fn rewrite_prefix_multi_level() {
        let from = "zroot/ROOT/default";
        let to = "zroot/ROOT/be2";
        assert_eq!(rewrite_prefix(from, from, to).as_deref(), Some(to));
        assert_eq!(
            rewrite_prefix("zroot/ROOT/default/usr/local/lib", from, to).as_deref(),
            Some("zroot/ROOT/be2/usr/local/lib")
        );
    }

    #[test]
    fn rewrite_prefix_requires_component_boundary() {
        assert_eq!(
            rewrite_prefix("zroot/ROOT/default2/var", "zroot/ROOT/default", "x"),
            None
        );
        assert_eq!(rewrite_prefix("tank/var", "zroot/ROOT/default", "x"), None);
    }

    #[test]
    fn pool_and_parent() {
        assert_eq!(pool_of("zroot/ROOT/default"), "zroot");
        assert_eq!(pool_of("zroot"), "zroot");
        assert_eq!(parent_of("zroot/ROOT/default"), Some("zroot/ROOT"));
        assert_eq!(parent_of("zroot"), None);
    }
}
