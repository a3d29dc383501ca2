use bootenv_backend::BackendError;
use bootenv_store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failure kinds reported by boot-environment operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeErrorKind {
    /// The destination boot environment already exists.
    Exists,
    /// A source, snapshot, or boot-environment root is missing.
    NotFound,
    PermissionDenied,
    /// The backend connection was lost or could not be established.
    Unavailable,
    /// The backend rejected a property key or value.
    BadProperty,
    /// Undoing a failed operation did not fully succeed; the pool may hold
    /// orphaned datasets.
    PartialFailure,
    InvalidName,
}

impl BeErrorKind {
    pub fn description(self) -> &'static str {
        match self {
            BeErrorKind::Exists => "boot environment already exists",
            BeErrorKind::NotFound => "boot environment or snapshot does not exist",
            BeErrorKind::PermissionDenied => "permission denied",
            BeErrorKind::Unavailable => "storage backend unavailable",
            BeErrorKind::BadProperty => "invalid property",
            BeErrorKind::PartialFailure => {
                "cleanup after failure was incomplete; manual intervention may be required"
            }
            BeErrorKind::InvalidName => "invalid boot environment or snapshot name",
        }
    }
}

impl fmt::Display for BeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeErrorKind::Exists => write!(f, "exists"),
            BeErrorKind::NotFound => write!(f, "not-found"),
            BeErrorKind::PermissionDenied => write!(f, "permission-denied"),
            BeErrorKind::Unavailable => write!(f, "unavailable"),
            BeErrorKind::BadProperty => write!(f, "bad-property"),
            BeErrorKind::PartialFailure => write!(f, "partial-failure"),
            BeErrorKind::InvalidName => write!(f, "invalid-name"),
        }
    }
}

impl From<&BackendError> for BeErrorKind {
    fn from(e: &BackendError) -> Self {
        match e {
            BackendError::NotFound(_) => BeErrorKind::NotFound,
            BackendError::Exists(_) => BeErrorKind::Exists,
            BackendError::PermissionDenied(_) => BeErrorKind::PermissionDenied,
            BackendError::BadProperty { .. } => BeErrorKind::BadProperty,
            BackendError::Unavailable(_) | BackendError::Io(_) | BackendError::CommandFailed(_) => {
                BeErrorKind::Unavailable
            }
        }
    }
}

/// Error returned by every fallible handle operation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BeError {
    kind: BeErrorKind,
    message: String,
    original: Option<BeErrorKind>,
    leftover: Vec<String>,
    #[source]
    source: Option<BackendError>,
}

impl BeError {
    pub fn new(kind: BeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            original: None,
            leftover: Vec::new(),
            source: None,
        }
    }

    /// Wrap a backend failure, classifying it at the point of detection.
    pub fn backend(err: BackendError, context: impl fmt::Display) -> Self {
        Self {
            kind: BeErrorKind::from(&err),
            message: format!("{context}: {err}"),
            original: None,
            leftover: Vec::new(),
            source: Some(err),
        }
    }

    /// Rollback after `original` left `leftover` datasets behind.
    pub fn partial(original: BeError, leftover: Vec<String>) -> Self {
        let message = format!(
            "{} ({}); rollback left behind: {}",
            original.message,
            original.kind,
            leftover.join(", ")
        );
        Self {
            kind: BeErrorKind::PartialFailure,
            message,
            original: Some(original.kind),
            leftover,
            source: original.source,
        }
    }

    pub fn kind(&self) -> BeErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// For `PartialFailure`, the kind of the failure that triggered rollback.
    pub fn original_kind(&self) -> Option<BeErrorKind> {
        self.original
    }

    /// For `PartialFailure`, datasets rollback could not remove, in the order
    /// rollback attempted them.
    pub fn leftover(&self) -> &[String] {
        &self.leftover
    }
}

impl From<StoreError> for BeError {
    fn from(e: StoreError) -> Self {
        BeError::new(BeErrorKind::Unavailable, format!("state directory: {e}"))
    }
}

impl From<std::io::Error> for BeError {
    fn from(e: std::io::Error) -> Self {
        BeError::new(BeErrorKind::Unavailable, format!("state directory: {e}"))
    }
}

/// Receives every error a handle reports, at the point of failure.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, err: &BeError);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&BeError) + Send + Sync,
{
    fn emit(&self, err: &BeError) {
        self(err);
    }
}

/// Prints diagnostics to standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn emit(&self, err: &BeError) {
        eprintln!("bootenv: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::sync::Mutex;

    #[test]
    fn backend_errors_map_to_one_kind() {
        let cases = [
            (BackendError::NotFound("x".into()), BeErrorKind::NotFound),
            (BackendError::Exists("x".into()), BeErrorKind::Exists),
            (
                BackendError::PermissionDenied("x".into()),
                BeErrorKind::PermissionDenied,
            ),
            (
                BackendError::BadProperty {
                    name: "x".into(),
                    property: "p".into(),
                },
                BeErrorKind::BadProperty,
            ),
            (BackendError::Unavailable("x".into()), BeErrorKind::Unavailable),
            (BackendError::CommandFailed("x".into()), BeErrorKind::Unavailable),
        ];
        for (err, kind) in &cases {
            assert_eq!(BeErrorKind::from(err), *kind, "{err}");
        }
    }

    #[test]
    fn backend_error_keeps_source() {
        let e = BeError::backend(
            BackendError::NotFound("zroot/ROOT/x".into()),
            "cannot open source",
        );
        assert_eq!(e.kind(), BeErrorKind::NotFound);
        assert!(e.to_string().starts_with("cannot open source"));
        assert!(e.source().is_some());
    }

    #[test]
    fn partial_failure_carries_original_and_leftovers() {
        let original = BeError::new(BeErrorKind::BadProperty, "clone rejected");
        let e = BeError::partial(original, vec!["zroot/ROOT/be2".to_owned()]);
        assert_eq!(e.kind(), BeErrorKind::PartialFailure);
        assert_eq!(e.original_kind(), Some(BeErrorKind::BadProperty));
        assert_eq!(e.leftover(), ["zroot/ROOT/be2"]);
        let msg = e.to_string();
        assert!(msg.contains("clone rejected"));
        assert!(msg.contains("bad-property"));
        assert!(msg.contains("zroot/ROOT/be2"));
    }

    #[test]
    fn every_kind_has_a_description() {
        for kind in [
            BeErrorKind::Exists,
            BeErrorKind::NotFound,
            BeErrorKind::PermissionDenied,
            BeErrorKind::Unavailable,
            BeErrorKind::BadProperty,
            BeErrorKind::PartialFailure,
            BeErrorKind::InvalidName,
        ] {
            assert!(!kind.description().is_empty());
            assert!(!kind.to_string().is_empty());
        }
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |e: &BeError| seen.lock().unwrap().push(e.kind());
        sink.emit(&BeError::new(BeErrorKind::Exists, "dup"));
        assert_eq!(*seen.lock().unwrap(), vec![BeErrorKind::Exists]);
    }
}
