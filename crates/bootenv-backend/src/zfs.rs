use crate::backend::{DatasetBackend, PoolRef, Properties};
use crate::BackendError;
use std::process::{Command, Output};
use tracing::debug;

/// Backend driving the `zfs` and `zpool` command line tools.
///
/// Output is requested in scripted mode (`-H`, tab separated, no headers) and
/// failures are classified from the tool's stderr.
pub struct ZfsBackend {
    zfs: String,
    zpool: String,
}

impl Default for ZfsBackend {
    fn default() -> Self {
        Self::with_commands("zfs", "zpool")
    }
}

impl ZfsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commands(zfs: &str, zpool: &str) -> Self {
        Self {
            zfs: zfs.to_owned(),
            zpool: zpool.to_owned(),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, BackendError> {
        debug!("{program} {}", args.join(" "));
        let output = Command::new(program).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!("{program} not found"))
            } else {
                BackendError::Io(e)
            }
        })?;
        check_output(&output)
    }

    fn zfs(&self, args: &[&str]) -> Result<String, BackendError> {
        self.run(&self.zfs, args)
    }

    fn zpool(&self, args: &[&str]) -> Result<String, BackendError> {
        self.run(&self.zpool, args)
    }
}

fn check_output(output: &Output) -> Result<String, BackendError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
    }
}

/// Map a failing tool's stderr onto a backend error.
pub(crate) fn classify_failure(stderr: &str) -> BackendError {
    let msg = stderr.trim().to_owned();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("does not exist") || lower.contains("no such pool") {
        BackendError::NotFound(msg)
    } else if lower.contains("already exists") {
        BackendError::Exists(msg)
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        BackendError::PermissionDenied(msg)
    } else if lower.contains("invalid property") || lower.contains("bad property") {
        let property = lower
            .find("property")
            .and_then(|at| msg[at..].split('\'').nth(1))
            .map_or_else(|| msg.clone(), str::to_owned);
        BackendError::BadProperty {
            name: String::new(),
            property,
        }
    } else if lower.contains("failed to initialize") || lower.contains("/dev/zfs") {
        BackendError::Unavailable(msg)
    } else {
        BackendError::CommandFailed(msg)
    }
}

/// Parse `zfs get -H -o property,value` output.
pub(crate) fn parse_properties(output: &str) -> Properties {
    output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

/// Find the dataset mounted at `/` in `zfs list -H -o name,mountpoint,mounted` output.
pub(crate) fn parse_root_dataset(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split('\t');
        let name = fields.next()?;
        let mountpoint = fields.next()?;
        let mounted = fields.next()?;
        (mountpoint == "/" && mounted == "yes").then(|| name.to_owned())
    })
}

impl DatasetBackend for ZfsBackend {
    fn name(&self) -> &'static str {
        "zfs"
    }

    fn connect(&self) -> Result<(), BackendError> {
        self.zfs(&["version"]).map(|_| ()).map_err(|e| match e {
            BackendError::Unavailable(_) => e,
            other => BackendError::Unavailable(other.to_string()),
        })
    }

    fn root_dataset(&self) -> Result<String, BackendError> {
        let out = self.zfs(&["list", "-H", "-t", "filesystem", "-o", "name,mountpoint,mounted"])?;
        parse_root_dataset(&out)
            .ok_or_else(|| BackendError::NotFound("no dataset mounted at /".to_owned()))
    }

    fn pool_bootfs(&self, pool: &str) -> Result<Option<String>, BackendError> {
        let out = self.zpool(&["get", "-H", "-o", "value", "bootfs", pool])?;
        let value = out.trim();
        Ok((!value.is_empty() && value != "-").then(|| value.to_owned()))
    }

    fn open_pool(&self, pool: &str) -> Result<PoolRef, BackendError> {
        let out = self
            .zpool(&["get", "-H", "-p", "-o", "value", "guid", pool])
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let guid = out
            .trim()
            .parse::<u64>()
            .map_err(|e| BackendError::Unavailable(format!("bad guid for pool {pool}: {e}")))?;
        Ok(PoolRef {
            name: pool.to_owned(),
            guid,
        })
    }

    fn pool_is_open(&self, pool: &PoolRef) -> bool {
        self.open_pool(&pool.name)
            .is_ok_and(|current| current.guid == pool.guid)
    }

    fn exists(&self, name: &str) -> Result<bool, BackendError> {
        match self.zfs(&["list", "-H", "-t", "all", "-o", "name", name]) {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn children(&self, name: &str) -> Result<Vec<String>, BackendError> {
        let out = self.zfs(&["list", "-H", "-d", "1", "-t", "filesystem", "-o", "name", name])?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty() && *line != name)
            .map(str::to_owned)
            .collect())
    }

    fn local_properties(&self, name: &str) -> Result<Properties, BackendError> {
        let out = self.zfs(&[
            "get", "-H", "-p", "-s", "local", "-o", "property,value", "all", name,
        ])?;
        Ok(parse_properties(&out))
    }

    fn snapshot(&self, snapshot: &str, recursive: bool) -> Result<(), BackendError> {
        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(snapshot);
        self.zfs(&args).map(|_| ())
    }

    fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &Properties,
    ) -> Result<(), BackendError> {
        let opts: Vec<String> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["clone"];
        for opt in &opts {
            args.push("-o");
            args.push(opt);
        }
        args.push(snapshot);
        args.push(target);
        self.zfs(&args).map(|_| ()).map_err(|e| match e {
            BackendError::BadProperty { property, .. } => BackendError::BadProperty {
                name: target.to_owned(),
                property,
            },
            other => other,
        })
    }

    fn destroy(&self, name: &str, recursive: bool) -> Result<(), BackendError> {
        let mut args = vec!["destroy"];
        if recursive {
            args.push("-r");
        }
        args.push(name);
        self.zfs(&args).map(|_| ())
    }
}
