//! Compiler module - Source code compilation
//!
//! Compiles submissions and checkers inside a sandbox slot from the box
//! scheduler and persists the artifact in the store:
//! - Negative ids are checkers (`-problem_id`) and land in `checkers/<problemID>.bin`
//! - Positive ids are submissions and land in `compilations/<submissionID>.bin`
//!
//! Interpreted languages are not compiled; their source is the artifact.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::languages::Language;
use crate::sandbox::{box_path, get_config, RunConfig, RunStats, RunStatus, SandboxError};
use crate::scheduler::{BoxScheduler, BucketFile, ByteFile, ExecRequest};
use crate::storage::{ArtifactStore, Bucket, StoreError};

const COMPILE_STDOUT: &str = "/box/compile.out";
const COMPILE_STDERR: &str = "/box/compile.err";

/// Compilers spawn helpers (cc1plus, as, ld, ...)
const COMPILE_MAX_PROCS: u32 = 128;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no source file to compile")]
    NoSource,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to persist compilation artifact: {0}")]
    Store(#[from] StoreError),
}

/// Sources and language of one compilation
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    /// Submission id, or `-problem_id` for a checker
    pub id: i64,
    /// Path relative to the box root -> source bytes
    pub code_files: HashMap<String, Vec<u8>>,
    /// Path relative to the box root -> bytes, staged read-only
    pub header_files: HashMap<String, Vec<u8>>,
    pub lang: &'a Language,
}

/// Result of a compilation attempt
#[derive(Debug, Clone, Default)]
pub struct CompileResult {
    pub success: bool,
    /// Compiler stdout
    pub output: String,
    /// Compiler stderr, or why compilation failed when the compiler said nothing
    pub other: String,
    pub stats: Option<RunStats>,
}

impl CompileResult {
    /// Everything the compiler said, for display
    pub fn message(&self) -> String {
        match (self.output.trim().is_empty(), self.other.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.output.trim_end(), self.other.trim_end()),
            (false, true) => self.output.trim_end().to_string(),
            (true, _) => self.other.trim_end().to_string(),
        }
    }
}

/// Where the artifact of compilation `id` is stored
pub fn artifact_location(id: i64) -> (Bucket, String) {
    if id < 0 {
        (Bucket::Checkers, format!("{}.bin", -id))
    } else {
        (Bucket::Compilations, format!("{}.bin", id))
    }
}

/// Compile `req` and persist its artifact
pub async fn compile(scheduler: &BoxScheduler, req: &CompileRequest<'_>) -> Result<CompileResult, CompileError> {
    let (bucket, key) = artifact_location(req.id);

    let Some(compile_command) = &req.lang.compile_command else {
        // Interpreted language: the source file is the artifact
        let source = req
            .code_files
            .get(&req.lang.source_file)
            .or_else(|| {
                (req.code_files.len() == 1)
                    .then(|| req.code_files.values().next())
                    .flatten()
            })
            .ok_or(CompileError::NoSource)?;
        scheduler.store().write(bucket, &key, source).await?;
        debug!(id = req.id, "Stored interpreted source as {}/{}", bucket, key);
        return Ok(CompileResult {
            success: true,
            ..CompileResult::default()
        });
    };

    if req.code_files.is_empty() {
        return Err(CompileError::NoSource);
    }

    let config = get_config();
    let binary = box_path(&req.lang.compiled_file);

    let mut request = ExecRequest {
        command: compile_command.clone(),
        run_config: RunConfig {
            output_path: Some(COMPILE_STDOUT.to_string()),
            stderr_path: Some(COMPILE_STDERR.to_string()),
            time_limit: config.compile_time_limit_secs(),
            wall_time_limit: config.compile_time_limit_secs() * 2.0,
            memory_limit: config.compile_memory_limit_kb(),
            max_procs: COMPILE_MAX_PROCS,
            ..RunConfig::default()
        },
        output_byte_files: vec![COMPILE_STDOUT.to_string(), COMPILE_STDERR.to_string()],
        ..ExecRequest::default()
    };
    request
        .output_bucket_files
        .insert(binary.clone(), BucketFile::new(bucket, key.clone(), 0o755));
    for (path, code) in &req.code_files {
        request
            .input_byte_files
            .insert(box_path(path), ByteFile::new(code.clone(), 0o644));
    }
    for (path, header) in &req.header_files {
        request
            .input_byte_files
            .insert(box_path(path), ByteFile::new(header.clone(), 0o444));
    }

    let response = scheduler.run(&request).await?;
    let output = text(response.file(COMPILE_STDOUT));
    let mut other = text(response.file(COMPILE_STDERR));
    let produced = response.stored.contains(&binary);
    let stats = response.stats;

    if stats.is_success() && produced {
        debug!(id = req.id, "Compiled into {}/{}", bucket, key);
        return Ok(CompileResult {
            success: true,
            output,
            other,
            stats: Some(stats),
        });
    }

    if produced {
        scheduler.store().delete(bucket, &key).await?;
    }
    if other.trim().is_empty() && output.trim().is_empty() {
        other = match stats.status {
            RunStatus::TimedOut => "Compilation timed out".to_string(),
            RunStatus::Signaled(_) => "Compiler crashed".to_string(),
            _ if stats.exit_code == 0 => "Compiler produced no executable".to_string(),
            _ => format!("Compilation failed with exit code {}", stats.exit_code),
        };
    }
    info!(id = req.id, "Compilation failed");

    Ok(CompileResult {
        success: false,
        output,
        other,
        stats: Some(stats),
    })
}

/// Remove the artifact of a submission compilation
pub async fn clean_compilation(store: &dyn ArtifactStore, id: i64) -> Result<(), StoreError> {
    let (bucket, key) = artifact_location(id);
    store.delete(bucket, &key).await
}

fn text(data: Option<&[u8]>) -> String {
    data.map(|d| String::from_utf8_lossy(d).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Languages;
    use crate::sandbox::fake::FakeBackend;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    const LANGUAGES: &str = r#"
[cpp]
extensions = ["cpp"]
source_file = "main.cpp"
compiled_file = "main"
compile_command = "g++ -o /box/main /box/main.cpp"
run_command = "/box/main"

[python3]
extensions = ["py"]
source_file = "main.py"
run_command = "python3 /box/main.py"
"#;

    /// "Compiles" by copying the source unless it contains "syntax error"
    fn compiler_backend() -> FakeBackend {
        FakeBackend::new(|_, _, files| {
            let source = files.get("/box/main.cpp").cloned().unwrap_or_default();
            if String::from_utf8_lossy(&source).contains("syntax error") {
                files.insert(COMPILE_STDERR.into(), b"main.cpp:1: error: expected ';'".to_vec());
                return RunStats {
                    exit_code: 1,
                    status: RunStatus::RuntimeError,
                    ..RunStats::default()
                };
            }
            let header = files.get("/box/testlib.h").cloned().unwrap_or_default();
            files.insert("/box/main".into(), [source, header].concat());
            RunStats::default()
        })
    }

    fn request<'a>(id: i64, lang: &'a Language, code: &str) -> CompileRequest<'a> {
        CompileRequest {
            id,
            code_files: HashMap::from([(lang.source_file.clone(), code.as_bytes().to_vec())]),
            header_files: HashMap::new(),
            lang,
        }
    }

    fn scheduler() -> BoxScheduler {
        BoxScheduler::new(Arc::new(compiler_backend()), Arc::new(MemoryStore::new()), 0, 1)
    }

    #[test]
    fn test_artifact_location() {
        assert_eq!(artifact_location(-3), (Bucket::Checkers, "3.bin".to_string()));
        assert_eq!(artifact_location(3), (Bucket::Compilations, "3.bin".to_string()));
    }

    #[tokio::test]
    async fn test_compile_success_persists_artifact() {
        let languages = Languages::from_toml(LANGUAGES).unwrap();
        let cpp = languages.get("cpp").unwrap();
        let scheduler = scheduler();

        let result = compile(&scheduler, &request(5, cpp, "int main(){}")).await.unwrap();
        assert!(result.success);
        assert_eq!(
            scheduler.store().read(Bucket::Compilations, "5.bin").await.unwrap(),
            b"int main(){}"
        );
    }

    #[tokio::test]
    async fn test_checker_ids_use_checker_bucket_with_headers() {
        let languages = Languages::from_toml(LANGUAGES).unwrap();
        let cpp = languages.get("cpp").unwrap();
        let scheduler = scheduler();

        let mut req = request(-7, cpp, "checker;");
        req.header_files.insert("testlib.h".into(), b"//testlib".to_vec());
        let result = compile(&scheduler, &req).await.unwrap();

        assert!(result.success);
        assert_eq!(
            scheduler.store().read(Bucket::Checkers, "7.bin").await.unwrap(),
            b"checker;//testlib"
        );
        assert!(scheduler.store().stat(Bucket::Compilations, "7.bin").await.is_err());
    }

    #[tokio::test]
    async fn test_compile_error_is_data() {
        let languages = Languages::from_toml(LANGUAGES).unwrap();
        let cpp = languages.get("cpp").unwrap();
        let scheduler = scheduler();

        let result = compile(&scheduler, &request(6, cpp, "syntax error")).await.unwrap();
        assert!(!result.success);
        assert!(result.other.contains("expected ';'"));
        assert!(result.message().contains("expected ';'"));
        assert!(scheduler
            .store()
            .stat(Bucket::Compilations, "6.bin")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_interpreted_source_is_artifact() {
        let languages = Languages::from_toml(LANGUAGES).unwrap();
        let python = languages.get("python3").unwrap();
        let backend = Arc::new(compiler_backend());
        let scheduler = BoxScheduler::new(backend.clone(), Arc::new(MemoryStore::new()), 0, 1);

        let result = compile(&scheduler, &request(8, python, "print(1)")).await.unwrap();
        assert!(result.success);
        assert_eq!(backend.opened(), 0);
        assert_eq!(
            scheduler.store().read(Bucket::Compilations, "8.bin").await.unwrap(),
            b"print(1)"
        );

        clean_compilation(scheduler.store().as_ref(), 8).await.unwrap();
        assert!(scheduler.store().read(Bucket::Compilations, "8.bin").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let languages = Languages::from_toml(LANGUAGES).unwrap();
        let cpp = languages.get("cpp").unwrap();
        let req = CompileRequest {
            id: 1,
            code_files: HashMap::new(),
            header_files: HashMap::new(),
            lang: cpp,
        };
        assert!(matches!(
            compile(&scheduler(), &req).await,
            Err(CompileError::NoSource)
        ));
    }
}
