use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HooktailError {
    #[error("Failed to raise memlock rlimit: {0}")]
    PrivilegeError(String),

    #[error("Failed to load eBPF program: {0}")]
    ProgramLoadFailed(String),

    #[error("Failed to attach eBPF program: {0}")]
    AttachFailed(String),

    #[error("eBPF map error: {0}")]
    MapError(String),

    #[error("Pin path {} already exists (unclean previous shutdown?)", path.display())]
    PinConflict { path: PathBuf },

    #[error("Failed to pin map at {}: {reason}", path.display())]
    PinFailed { path: PathBuf, reason: String },

    #[error("Failed to remove pinned map at {}: {source}", path.display())]
    UnpinFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run eBPF program: {0}")]
    ProgramRunFailed(String),

    #[error("Trace log {} unavailable: {source}", path.display())]
    TraceLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HooktailError>;
