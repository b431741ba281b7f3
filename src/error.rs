use camino::Utf8PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How an existing target entry clashes with a proposed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A symlink exists but points somewhere else.
    WrongTarget,
    /// A regular file occupies the target path.
    RegularFile,
    /// A directory occupies the target path.
    Directory,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::WrongTarget => write!(f, "symlink points elsewhere"),
            ConflictKind::RegularFile => write!(f, "regular file in the way"),
            ConflictKind::Directory => write!(f, "directory in the way"),
        }
    }
}

/// Every failure in the crate belongs to exactly one of these kinds.
///
/// The planner and scanner never recover; the executor recovers only by
/// rollback; services translate kinds into user-facing messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: Utf8PathBuf, reason: String },

    #[error("package not found: {name}")]
    PackageNotFound { name: String },

    #[error("reserved package name: {name}")]
    ReservedPackageName { name: String },

    #[error("source does not exist: {path}")]
    SourceNotFound { path: Utf8PathBuf },

    #[error("parent directory does not exist: {path}")]
    ParentNotFound { path: Utf8PathBuf },

    #[error("conflict at {target}: {kind}")]
    Conflict {
        target: Utf8PathBuf,
        kind: ConflictKind,
    },

    #[error("cyclic dependency among {} operations", cycle.len())]
    CyclicDependency { cycle: Vec<u64> },

    #[error("filesystem {op} failed at {path}")]
    FilesystemOperation {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("permission denied: {path}")]
    PermissionDenied { path: Utf8PathBuf },

    #[error(
        "execution failed: {executed} executed, operation {failed} failed, {rolled_back} rolled back"
    )]
    ExecutionFailed {
        executed: usize,
        failed: usize,
        rolled_back: usize,
        errors: Vec<Error>,
    },

    #[error("{} errors occurred", errors.len())]
    Multiple { errors: Vec<Error> },

    #[error("plan contains no operations")]
    EmptyPlan,

    #[error("no checkpoint recorded for operation {id}")]
    CheckpointNotFound { id: u64 },

    #[error("operation canceled")]
    Canceled,

    #[error("not implemented: {feature}")]
    NotImplemented { feature: &'static str },

    #[error("package directory not empty: {path}")]
    PackageDirNotEmpty { path: Utf8PathBuf },

    #[error("invalid bootstrap file: {reason}")]
    InvalidBootstrap { reason: String },

    #[error("profile not found: {name}")]
    ProfileNotFound { name: String },

    #[error("bootstrap file already exists: {path}")]
    BootstrapExists { path: Utf8PathBuf },

    #[error("bootstrap file not found: {path}")]
    BootstrapNotFound { path: Utf8PathBuf },
}

impl Error {
    /// Wrap an I/O error, lifting permission failures into their own kind.
    pub fn io(op: &'static str, path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied { path }
        } else {
            Error::FilesystemOperation { op, path, source }
        }
    }

    /// Collapse a list of errors into one, unwrapping singletons.
    pub fn aggregate(mut errors: Vec<Error>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Error::Multiple { errors }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_maps_permission_denied() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = Error::io("symlink", Utf8PathBuf::from("/t/.vimrc"), io);
        assert!(matches!(err, Error::PermissionDenied { .. }));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::io("readdir", Utf8PathBuf::from("/p/vim"), io);
        assert!(matches!(
            err,
            Error::FilesystemOperation { op: "readdir", .. }
        ));
    }

    #[test]
    fn test_aggregate_unwraps_singleton() {
        let single = Error::aggregate(vec![Error::EmptyPlan]);
        assert!(matches!(single, Error::EmptyPlan));

        let several = Error::aggregate(vec![Error::EmptyPlan, Error::Canceled]);
        assert!(matches!(several, Error::Multiple { errors } if errors.len() == 2));
    }
}
