#[cfg(target_os = "linux")]
pub mod agent;
pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod lifecycle;
pub mod trace_log;

pub use error::{HooktailError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
