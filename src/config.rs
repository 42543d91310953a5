//! Worker configuration from environment variables
//!
//! `.env` is loaded by the binary before `GraderConfig::from_env` runs.
//! Object store credentials (`MINIO_*`) are read by `S3Store::from_env`.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::sandbox::BOXES_PER_WORKER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Fs,
    S3,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" => Ok(StorageBackend::Fs),
            "s3" | "minio" => Ok(StorageBackend::S3),
            other => bail!("unknown storage backend {:?} (expected fs or s3)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Isolate,
    /// Unisolated child processes with rlimits, for development only
    Local,
}

impl FromStr for SandboxKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "isolate" => Ok(SandboxKind::Isolate),
            "local" => Ok(SandboxKind::Local),
            other => bail!("unknown sandbox backend {:?} (expected isolate or local)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraderConfig {
    pub redis_url: String,
    pub storage_backend: StorageBackend,
    /// Root of the filesystem store
    pub storage_dir: PathBuf,
    pub sandbox: SandboxKind,
    pub isolate_path: String,
    /// Fail at startup unless isolate can use cgroups
    pub require_cgroups: bool,
    /// Sandbox slots of this worker, at most `BOXES_PER_WORKER`
    pub boxes: usize,
    /// Submissions graded at the same time
    pub max_submissions: usize,
    pub testlib_path: PathBuf,
    /// Replaces the built-in language table when set
    pub languages_config: Option<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".into(),
            storage_backend: StorageBackend::Fs,
            storage_dir: PathBuf::from("./data"),
            sandbox: SandboxKind::Isolate,
            isolate_path: "isolate".into(),
            require_cgroups: true,
            boxes: 4,
            max_submissions: 2,
            testlib_path: PathBuf::from("./files/testlib.h"),
            languages_config: None,
        }
    }
}

impl GraderConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, falling back to defaults for missing keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let number = |key: &str, default: usize| -> Result<usize> {
            match var(key) {
                Some(v) => {
                    let n: usize = v
                        .trim()
                        .parse()
                        .with_context(|| format!("{} must be a positive integer, got {:?}", key, v))?;
                    if n == 0 {
                        bail!("{} must be at least 1", key);
                    }
                    Ok(n)
                }
                None => Ok(default),
            }
        };

        Ok(Self {
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            storage_backend: var("STORAGE_BACKEND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(defaults.storage_backend),
            storage_dir: var("STORAGE_DIR").map(PathBuf::from).unwrap_or(defaults.storage_dir),
            sandbox: var("SANDBOX_BACKEND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(defaults.sandbox),
            isolate_path: var("ISOLATE_PATH").unwrap_or(defaults.isolate_path),
            require_cgroups: var("REQUIRE_CGROUPS")
                .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(defaults.require_cgroups),
            boxes: match number("GRADER_BOXES", defaults.boxes)? {
                n if n > BOXES_PER_WORKER => bail!(
                    "GRADER_BOXES must be at most {} (box ids of other workers start there), got {}",
                    BOXES_PER_WORKER,
                    n
                ),
                n => n,
            },
            max_submissions: number("GRADER_MAX_SUBMISSIONS", defaults.max_submissions)?,
            testlib_path: var("TESTLIB_PATH").map(PathBuf::from).unwrap_or(defaults.testlib_path),
            languages_config: var("LANGUAGES_CONFIG").map(PathBuf::from),
        })
    }
}
