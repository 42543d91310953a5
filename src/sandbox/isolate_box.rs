//! Isolate box management
//!
//! Low-level wrapper around the isolate sandbox for secure code execution.
//! Manages box initialization, cleanup, and command execution.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use super::config::{box_id_base, get_config};
use super::meta::{parse_meta, RunStats, RunStatus};
use super::{relative_box_path, RunConfig, Sandbox, SandboxBackend, SandboxError};

/// Cached cgroup availability
static USE_CGROUPS: OnceLock<bool> = OnceLock::new();

/// Maximum file size a program may create, in KB
const FSIZE_LIMIT_KB: u32 = 262_144; // 256MB
const OPEN_FILES_LIMIT: u32 = 256;
/// Sink for program streams nobody collects
const DISCARD: &str = "/dev/null";

/// Check if isolate cgroups are available.
///
/// Probes with `probe_box`, which must belong to this worker and not be in use yet.
pub async fn is_cgroups_available(isolate_bin: &str, probe_box: u32) -> bool {
    if let Some(value) = USE_CGROUPS.get() {
        return *value;
    }
    let probe_box = probe_box.to_string();

    // Try to initialize a test box with cgroups
    let test_result = Command::new(isolate_bin)
        .args(["--box-id", &probe_box, "--cg", "--init"])
        .output()
        .await;

    // Cleanup
    let _ = Command::new(isolate_bin)
        .args(["--box-id", &probe_box, "--cleanup"])
        .output()
        .await;

    let available = match test_result {
        Ok(r) => r.status.success(),
        Err(_) => false,
    };

    let _ = USE_CGROUPS.set(available);
    available
}

/// Ensure cgroups are available; return an error otherwise
pub async fn ensure_cgroups_available(isolate_bin: &str, probe_box: u32) -> anyhow::Result<()> {
    if is_cgroups_available(isolate_bin, probe_box).await {
        Ok(())
    } else {
        anyhow::bail!("Isolate cgroup support is required but not available. Install isolate with cgroup support and ensure cgroups are enabled.")
    }
}

/// Opens isolate boxes
#[derive(Debug, Clone)]
pub struct IsolateBackend {
    isolate_bin: String,
    use_cgroups: bool,
}

impl IsolateBackend {
    pub fn new(isolate_bin: impl Into<String>, use_cgroups: bool) -> Self {
        Self {
            isolate_bin: isolate_bin.into(),
            use_cgroups,
        }
    }

    /// Probe the host for cgroup support in the worker's first box, before
    /// the scheduler hands it out. With `require_cgroups` the probe must
    /// succeed, otherwise memory falls back to max-rss accounting.
    pub async fn detect(isolate_bin: &str, require_cgroups: bool) -> anyhow::Result<Self> {
        let probe_box = box_id_base(get_config().worker_id);
        if require_cgroups {
            ensure_cgroups_available(isolate_bin, probe_box).await?;
        }
        let use_cgroups = is_cgroups_available(isolate_bin, probe_box).await;
        if !use_cgroups {
            warn!("Isolate cgroups unavailable, memory limits use max-rss accounting");
        }
        Ok(Self::new(isolate_bin, use_cgroups))
    }
}

#[async_trait]
impl SandboxBackend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn open(&self, box_id: u32) -> Result<Box<dyn Sandbox>, SandboxError> {
        let sandbox = IsolateBox::new(&self.isolate_bin, box_id, self.use_cgroups).await?;
        Ok(Box::new(sandbox))
    }
}

/// Isolate box manager
pub struct IsolateBox {
    isolate_bin: String,
    box_id: u32,
    box_path: String,
    use_cgroups: bool,
}

impl IsolateBox {
    /// Create and initialize a new isolate box
    pub async fn new(isolate_bin: &str, box_id: u32, use_cgroups: bool) -> Result<Self, SandboxError> {
        let init_error = |message: String| SandboxError::Init { box_id, message };

        // Clean up any existing box
        let _ = Command::new(isolate_bin)
            .args(["--box-id", &box_id.to_string(), "--cleanup"])
            .output()
            .await;

        let box_id_str = box_id.to_string();
        let mut args = vec!["--box-id", &box_id_str];
        if use_cgroups {
            args.push("--cg");
        }
        args.push("--init");

        let output = Command::new(isolate_bin)
            .args(&args)
            .output()
            .await
            .map_err(|e| init_error(format!("failed to run isolate --init: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(init_error(stderr.trim().to_string()));
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(
            "Initialized isolate box {} at {} (cgroups: {})",
            box_id, box_path, use_cgroups
        );

        Ok(Self {
            isolate_bin: isolate_bin.to_string(),
            box_id,
            box_path,
            use_cgroups,
        })
    }

    /// Get the path to the box/box subdirectory (working directory for programs)
    pub fn work_dir(&self) -> String {
        format!("{}/box", self.box_path)
    }

    fn host_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = relative_box_path(path)?;
        Ok(PathBuf::from(self.work_dir()).join(relative))
    }

    fn meta_file(&self) -> String {
        format!("/tmp/isolate_meta_{}.txt", self.box_id)
    }

    fn build_args(&self, command: &[String], config: &RunConfig) -> Result<Vec<String>, SandboxError> {
        let mut args = vec!["--box-id".to_string(), self.box_id.to_string()];

        // Add cgroup options if available
        if self.use_cgroups {
            args.push("--cg".to_string());
            if config.memory_limit > 0 {
                args.push(format!("--cg-mem={}", config.memory_limit));
            }
        } else if config.memory_limit > 0 {
            args.push(format!("--mem={}", config.memory_limit));
        }

        if config.time_limit > 0.0 {
            args.push(format!("--time={}", config.time_limit));
        }
        if config.wall_time_limit > 0.0 {
            args.push(format!("--wall-time={}", config.wall_time_limit));
        }

        args.extend([
            format!("--meta={}", self.meta_file()),
            format!("--processes={}", config.max_procs),
            format!("--open-files={}", OPEN_FILES_LIMIT),
            format!("--fsize={}", FSIZE_LIMIT_KB),
            // Mount directories needed for runtime
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64:maybe".to_string(),
            "--dir=/etc:noexec".to_string(),
            "--dir=/tmp:tmp".to_string(),
            // Environment variables
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
        ]);

        // Isolate resolves relative redirections against the box directory
        if let Some(input) = &config.input_path {
            args.push(format!("--stdin={}", relative_box_path(input)?));
        }
        // Unredirected streams go to /dev/null; nothing reaches isolate's own pipes
        let stdout = match &config.output_path {
            Some(output) => relative_box_path(output)?,
            None => DISCARD,
        };
        args.push(format!("--stdout={}", stdout));
        if config.stderr_to_stdout {
            args.push("--stderr-to-stdout".to_string());
        } else {
            let stderr = match &config.stderr_path {
                Some(stderr) => relative_box_path(stderr)?,
                None => DISCARD,
            };
            args.push(format!("--stderr={}", stderr));
        }

        args.push("--run".to_string());
        args.push("--".to_string());

        // Prepend /usr/bin/ to the command if it's not an absolute path
        let mut cmd_iter = command.iter();
        let program = cmd_iter.next().ok_or(SandboxError::EmptyCommand)?;
        if program.starts_with('/') || program.starts_with("./") {
            args.push(program.clone());
        } else {
            args.push(format!("/usr/bin/{}", program));
        }
        args.extend(cmd_iter.cloned());

        Ok(args)
    }
}

#[async_trait]
impl Sandbox for IsolateBox {
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
        let args = self.build_args(command, config)?;
        let meta_file = self.meta_file();

        debug!("Running isolate with args: {:?}", args);

        // Only isolate's own diagnostics are captured
        let output = Command::new(&self.isolate_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        // Parse meta file
        let meta_content = fs::read_to_string(&meta_file).await.unwrap_or_default();
        let _ = fs::remove_file(&meta_file).await;

        if meta_content.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Run(format!(
                "isolate exited with {} and wrote no meta file: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stats = parse_meta(&meta_content);
        if stats.status == RunStatus::InternalError {
            return Err(SandboxError::Run(stats.message));
        }
        Ok(stats)
    }

    /// Cleanup the isolate box
    async fn close(self: Box<Self>) -> Result<(), SandboxError> {
        Command::new(&self.isolate_bin)
            .args(["--box-id", &self.box_id.to_string(), "--cleanup"])
            .output()
            .await?;
        debug!("Cleaned up isolate box {}", self.box_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box(use_cgroups: bool) -> IsolateBox {
        IsolateBox {
            isolate_bin: "isolate".into(),
            box_id: 7,
            box_path: "/var/local/lib/isolate/7".into(),
            use_cgroups,
        }
    }

    #[test]
    fn test_build_args_with_cgroups() {
        let config = RunConfig {
            input_path: Some("/box/stdin.in".into()),
            output_path: Some("/box/stdin.out".into()),
            time_limit: 1.5,
            wall_time_limit: 4.0,
            memory_limit: 65536,
            ..RunConfig::default()
        };
        let args = test_box(true)
            .build_args(&["/box/main".to_string()], &config)
            .unwrap();

        assert!(args.contains(&"--cg".to_string()));
        assert!(args.contains(&"--cg-mem=65536".to_string()));
        assert!(args.contains(&"--time=1.5".to_string()));
        assert!(args.contains(&"--wall-time=4".to_string()));
        assert!(args.contains(&"--stdin=stdin.in".to_string()));
        assert!(args.contains(&"--stdout=stdin.out".to_string()));
        assert_eq!(args.last().unwrap(), "/box/main");
    }

    #[test]
    fn test_build_args_without_limits() {
        let config = RunConfig {
            stderr_path: Some("/box/err.txt".into()),
            ..RunConfig::default()
        };
        let command = vec!["python3".to_string(), "/box/main.py".to_string()];
        let args = test_box(false).build_args(&command, &config).unwrap();

        assert!(!args.iter().any(|a| a.starts_with("--time")));
        assert!(!args.iter().any(|a| a.starts_with("--mem")));
        assert!(args.contains(&"--stderr=err.txt".to_string()));
        assert!(args.ends_with(&["/usr/bin/python3".to_string(), "/box/main.py".to_string()]));
    }

    #[test]
    fn test_build_args_discards_unredirected_streams() {
        // File I/O run: the program writes its answer to a file, not stdout
        let config = RunConfig {
            stderr_path: Some("/box/stderr.out".into()),
            time_limit: 1.0,
            ..RunConfig::default()
        };
        let args = test_box(true)
            .build_args(&["/box/main".to_string()], &config)
            .unwrap();
        assert!(args.contains(&"--stdout=/dev/null".to_string()));
        assert!(args.contains(&"--stderr=stderr.out".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--stdin")));

        let args = test_box(true)
            .build_args(&["/box/main".to_string()], &RunConfig::default())
            .unwrap();
        assert!(args.contains(&"--stdout=/dev/null".to_string()));
        assert!(args.contains(&"--stderr=/dev/null".to_string()));
    }

    #[test]
    fn test_build_args_rejects_empty_command() {
        let result = test_box(true).build_args(&[], &RunConfig::default());
        assert!(matches!(result, Err(SandboxError::EmptyCommand)));
    }

    #[test]
    fn test_host_path_stays_in_box() {
        let sandbox = test_box(true);
        assert_eq!(
            sandbox.host_path("/box/main.cpp").unwrap(),
            PathBuf::from("/var/local/lib/isolate/7/box/main.cpp")
        );
        assert!(sandbox.host_path("/box/../../etc/shadow").is_err());
    }
}
