//! Local sandbox implementation
//!
//! Runs commands directly on the host inside a private temporary directory.
//! There is no isolation beyond rlimits, so this backend is for development
//! machines without isolate. `/box/...` arguments are rewritten to the
//! temporary directory before the command is spawned.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use tempfile::TempDir;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use super::meta::{RunStats, RunStatus};
use super::{relative_box_path, RunConfig, Sandbox, SandboxBackend, SandboxError, BOX_ROOT};

/// Wall clock cap for commands that did not ask for one
const DEFAULT_WALL_TIME_SECS: f64 = 60.0;

/// Opens local boxes
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("grader-box-{}-", box_id))
            .tempdir()
            .map_err(|e| SandboxError::Init {
                box_id,
                message: e.to_string(),
            })?;
        debug!("Opened local box {} at {:?}", box_id, dir.path());
        Ok(Box::new(LocalBox { box_id, dir }))
    }
}

/// A temporary directory standing in for `/box`
pub struct LocalBox {
    box_id: u32,
    dir: TempDir,
}

impl LocalBox {
    fn host_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        Ok(self.dir.path().join(relative_box_path(path)?))
    }

    /// Rewrite `/box/...` arguments to host paths
    fn map_arg(&self, arg: &str) -> String {
        match arg.strip_prefix(BOX_ROOT) {
            Some(rest) if rest.is_empty() => self.dir.path().to_string_lossy().into_owned(),
            Some(rest) if rest.starts_with('/') => {
                format!("{}{}", self.dir.path().to_string_lossy(), rest)
            }
            _ => arg.to_string(),
        }
    }

    fn open_redirect(&self, path: &Option<String>, write: bool) -> Result<Option<std::fs::File>, SandboxError> {
        let Some(path) = path else {
            return Ok(None);
        };
        let host = self.host_path(path)?;
        let file = if write {
            std::fs::File::create(&host)?
        } else {
            std::fs::File::open(&host)?
        };
        Ok(Some(file))
    }
}

fn to_stdio(file: Option<std::fs::File>) -> Stdio {
    file.map(Stdio::from).unwrap_or_else(Stdio::null)
}

#[async_trait]
impl Sandbox for LocalBox {
    fn box_id(&self) -> u32 {
        self.box_id
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<(), SandboxError> {
        let dest = self.host_path(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest, data).await?;
        fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let source = self.host_path(path)?;
        match fs::read(&source).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_command(&self, command: &[String], config: &RunConfig) -> Result<RunStats, SandboxError> {
        let (program, args) = command.split_first().ok_or(SandboxError::EmptyCommand)?;

        let stdin = self.open_redirect(&config.input_path, false)?;
        let stdout = self.open_redirect(&config.output_path, true)?;
        let stderr = if config.stderr_to_stdout {
            stdout.as_ref().map(|f| f.try_clone()).transpose()?
        } else {
            self.open_redirect(&config.stderr_path, true)?
        };

        let mut cmd = Command::new(self.map_arg(program));
        cmd.args(args.iter().map(|a| self.map_arg(a)))
            .current_dir(self.dir.path())
            .env("HOME", self.dir.path())
            .stdin(to_stdio(stdin))
            .stdout(to_stdio(stdout))
            .stderr(to_stdio(stderr))
            .kill_on_drop(true);

        let cpu_secs = config.time_limit.ceil() as u64;
        let memory_bytes = config.memory_limit.saturating_mul(1024);
        // SAFETY: only async-signal-safe setrlimit calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                if cpu_secs > 0 {
                    setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs + 1)?;
                }
                if memory_bytes > 0 {
                    setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)?;
                }
                Ok(())
            });
        }

        debug!("Running local command {:?} in box {}", command, self.box_id);

        let wall_limit = if config.wall_time_limit > 0.0 {
            config.wall_time_limit
        } else {
            DEFAULT_WALL_TIME_SECS
        };

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let waited = tokio::time::timeout(Duration::from_secs_f64(wall_limit), child.wait()).await;
        let wall_time = started.elapsed().as_secs_f64();

        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                child.kill().await?;
                return Ok(RunStats {
                    time: wall_time,
                    wall_time,
                    status: RunStatus::TimedOut,
                    message: "Wall time limit exceeded".to_string(),
                    ..RunStats::default()
                });
            }
        };

        // CPU time is not measured per child; wall time is the best estimate
        let mut stats = RunStats {
            time: wall_time,
            wall_time,
            ..RunStats::default()
        };

        match (status.code(), status.signal()) {
            (Some(code), _) => {
                stats.exit_code = code;
                if code != 0 {
                    stats.status = RunStatus::RuntimeError;
                }
            }
            (None, Some(sig)) => {
                let cpu_exceeded = sig == nix::libc::SIGXCPU
                    || (sig == nix::libc::SIGKILL && cpu_secs > 0 && wall_time >= config.time_limit);
                stats.status = if cpu_exceeded {
                    RunStatus::TimedOut
                } else {
                    RunStatus::Signaled(sig)
                };
            }
            (None, None) => stats.status = RunStatus::InternalError,
        }

        Ok(stats)
    }

    async fn close(self: Box<Self>) -> Result<(), SandboxError> {
        let LocalBox { box_id, dir } = *self;
        dir.close()?;
        debug!("Removed local box {}", box_id);
        Ok(())
    }
}
