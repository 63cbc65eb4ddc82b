use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Every failure mode a kiln component can surface, per the error-handling
/// design table: which ones are fatal and which are caught by the top-level
/// retry loop is encoded in how callers match on this type, not in the type
/// itself.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("no definition found for {reference}")]
    DefinitionMissing { reference: String },

    #[error("recursion loop detected at {path}")]
    CycleDetected { path: String },

    #[error("lock busy for {key}")]
    LockBusy { key: String },

    #[error("remote artifact server is not working")]
    RemoteUnavailable,

    #[error("stratum reproduction failed for {key}")]
    RemoteConflict { key: String },

    #[error("build command failed for {name}: {command} exited with {status}")]
    SandboxFailure {
        name: String,
        command: String,
        status: i32,
    },

    #[error("{free_gb}GB free is less than min-gigabytes {min_gb}")]
    DiskPressure { free_gb: u64, min_gb: u64 },

    #[error("interrupted")]
    Interrupt,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error during {operation}{}: {source}", path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
    Io {
        #[source]
        source: std::io::Error,
        path: Option<PathBuf>,
        operation: String,
    },
}

impl Error {
    pub fn definition_missing(reference: impl Into<String>) -> Self {
        Error::DefinitionMissing {
            reference: reference.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn io(source: std::io::Error, operation: impl Into<String>, path: Option<PathBuf>) -> Self {
        Error::Io {
            source,
            path,
            operation: operation.into(),
        }
    }
}

/// Result type threaded through every kiln crate.
pub type Result<T> = std::result::Result<T, Error>;
