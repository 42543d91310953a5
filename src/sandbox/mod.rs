//! Sandbox module - isolated execution units
//!
//! A sandbox stages files, runs exactly one command under resource limits and
//! lets the caller read back what the command produced. It handles:
//! - Box initialization and cleanup (every box starts from an empty filesystem)
//! - Limit enforcement (CPU time, wall time, memory, processes)
//! - Raw resource accounting returned as `RunStats`
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the grader's job)
//! - Know about languages or compilation
//! - Talk to the artifact store (the scheduler stages files)
//!
//! Paths handed to a sandbox are absolute paths under `/box/`, the working
//! directory of the program inside the box.

pub mod config;
#[cfg(test)]
pub mod fake;
pub mod isolate_box;
pub mod local;
pub mod meta;

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::StoreError;

pub use config::{box_id_base, get_config, init_config, SandboxConfig, BOXES_PER_WORKER};
pub use isolate_box::{ensure_cgroups_available, is_cgroups_available, IsolateBackend, IsolateBox};
pub use local::{LocalBackend, LocalBox};
pub use meta::{parse_meta, RunStats, RunStatus};

/// Working directory of programs inside a box
pub const BOX_ROOT: &str = "/box";

/// Resource limits and redirections for one command
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// File fed to stdin
    pub input_path: Option<String>,
    /// File receiving stdout
    pub output_path: Option<String>,
    /// File receiving stderr
    pub stderr_path: Option<String>,
    /// Send stderr wherever stdout goes
    pub stderr_to_stdout: bool,

    /// CPU time limit in seconds, 0 for none
    pub time_limit: f64,
    /// Wall clock limit in seconds, 0 for none
    pub wall_time_limit: f64,
    /// Memory limit in KB, 0 for none
    pub memory_limit: u64,

    /// Maximum number of processes
    pub max_procs: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_path: None,
            output_path: None,
            stderr_path: None,
            stderr_to_stdout: false,
            time_limit: 0.0,
            wall_time_limit: 0.0,
            memory_limit: 0,
            max_procs: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to initialize sandbox {box_id}: {message}")]
    Init { box_id: u32, message: String },

    #[error("path {0:?} is not inside {BOX_ROOT}")]
    InvalidPath(String),

    #[error("{0} does not exist in the sandbox")]
    FileNotFound(String),

    #[error("no command specified for execution")]
    EmptyCommand,

    #[error("sandbox failed to run command: {0}")]
    Run(String),

    #[error("sandbox pool is closed")]
    PoolClosed,

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to stage file: {0}")]
    Store(#[from] StoreError),
}

impl SandboxError {
    /// Errors raised while obtaining a box, as opposed to while using one
    pub fn is_allocation(&self) -> bool {
        matches!(self, SandboxError::PoolClosed | SandboxError::Init { .. })
    }
}

/// One isolated execution unit
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn box_id(&self) -> u32;

    /// Create or replace a file with the given permission bits
    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Run `command` to completion. Limit violations are reported in
    /// `RunStats`; only a failure of the sandbox itself is an error.
    async fn run_command(&self, command: &[String], config: &RunConfig)
        -> Result<RunStats, SandboxError>;

    /// Tear the box down
    async fn close(self: Box<Self>) -> Result<(), SandboxError>;
}

/// Factory for fresh sandboxes
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Initialize an empty box with the given id
    async fn open(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Absolute in-box path for a path relative to the box root
pub fn box_path(relative: &str) -> String {
    format!("{}/{}", BOX_ROOT, relative.trim_start_matches('/'))
}

/// Path relative to the box root; rejects anything outside of it
pub fn relative_box_path(path: &str) -> Result<&str, SandboxError> {
    let relative = path
        .strip_prefix(BOX_ROOT)
        .and_then(|p| p.strip_prefix('/'))
        .ok_or_else(|| SandboxError::InvalidPath(path.to_string()))?;

    let escapes = relative
        .split('/')
        .any(|component| component.is_empty() || component == "." || component == "..");
    if escapes {
        return Err(SandboxError::InvalidPath(path.to_string()));
    }
    Ok(relative)
}
