use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;

/// Failure of an external tool (`virtualenv`, `pip`) driven by a [`crate::Tooling`].
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Status { program: String, status: ExitStatus },

    #[error("{0}")]
    Failed(String),
}

/// Errors surfaced by the pool and its building blocks.
///
/// Contention on the lock primitives (a marker directory that already exists or is
/// already gone) is never reported through this type: those outcomes are turned into
/// "try the next environment" by the callers.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A lock was released twice, or its marker was swept while still logically held.
    #[error("lock state violation at {}", path.display())]
    LockState { path: PathBuf },

    #[error("failed to provision environment {}: {source}", path.display())]
    Provision {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("failed to install requirements into {}: {source}", path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("no compatible python{version} environment after {attempts} provisions for: {recipe}")]
    Unsatisfiable {
        version: String,
        recipe: String,
        attempts: u32,
    },

    #[error("invalid requirement: {0}")]
    InvalidRequirement(String),

    #[error("invalid runtime version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid config {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PoolError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        PoolError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// The raw OS error code, when the error came from the operating system.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            PoolError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Attaches the path an io operation was working on.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| PoolError::io(path, e))
    }
}
