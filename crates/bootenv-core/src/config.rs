use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bootenv.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings used to open a [`Handle`](crate::Handle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Backend name, see [`bootenv_backend::select_backend`].
    pub backend: String,
    /// Pool to manage; defaults to the pool holding the running root.
    pub pool: Option<String>,
    /// Explicit boot-environment root dataset.
    pub be_root: Option<String>,
    pub print_on_error: bool,
    /// Enables the clone journal and its lock when set.
    pub state_dir: Option<PathBuf>,
    pub zfs_command: String,
    pub zpool_command: String,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            backend: "zfs".to_owned(),
            pool: None,
            be_root: None,
            print_on_error: false,
            state_dir: None,
            zfs_command: "zfs".to_owned(),
            zpool_command: "zpool".to_owned(),
        }
    }
}

impl HandleConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`]; a missing file yields the defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    #[must_use]
    pub fn with_backend(mut self, backend: &str) -> Self {
        backend.clone_into(&mut self.backend);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = Some(pool.to_owned());
        self
    }

    #[must_use]
    pub fn with_be_root(mut self, be_root: &str) -> Self {
        self.be_root = Some(be_root.to_owned());
        self
    }

    #[must_use]
    pub fn with_print_on_error(mut self, enabled: bool) -> Self {
        self.print_on_error = enabled;
        self
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HandleConfig::default();
        assert_eq!(config.backend, "zfs");
        assert_eq!(config.zfs_command, "zfs");
        assert!(!config.print_on_error);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootenv.toml");
        std::fs::write(
            &path,
            r#"
pool = "zroot"
print_on_error = true
state_dir = "/var/db/bootenv"
"#,
        )
        .unwrap();

        let config = HandleConfig::load(&path).unwrap();
        assert_eq!(config.pool.as_deref(), Some("zroot"));
        assert!(config.print_on_error);
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/db/bootenv")));
        assert_eq!(config.backend, "zfs");
        assert_eq!(config.zpool_command, "zpool");
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootenv.toml");
        std::fs::write(&path, "pool = [unterminated").unwrap();
        assert!(matches!(
            HandleConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            HandleConfig::load(&dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn builder_setters() {
        let config = HandleConfig::default()
            .with_backend("memory")
            .with_pool("tank")
            .with_be_root("tank/bootenv")
            .with_print_on_error(true)
            .with_state_dir("/tmp/state");
        assert_eq!(config.backend, "memory");
        assert_eq!(config.pool.as_deref(), Some("tank"));
        assert_eq!(config.be_root.as_deref(), Some("tank/bootenv"));
        assert!(config.print_on_error);
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/state")));
    }
}
