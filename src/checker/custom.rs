//! Compiled (standard and legacy) checkers

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{
    parse_checker_output, CheckerCache, CheckerEnv, CheckerOutcome, Checker, PrepareError,
    WRONG_CHECKER_OUTPUT,
};
use crate::compiler::{compile, CompileRequest};
use crate::core::models::CheckerSource;
use crate::languages::Language;
use crate::sandbox::{box_path, get_config, RunConfig, SandboxError};
use crate::scheduler::{BucketFile, ByteFile, ExecRequest};
use crate::storage::{subtest_key, test_input_key, test_output_key, Bucket};

const VERDICT_OUT: &str = "/box/checker_verdict.out";
const VERDICT_ERR: &str = "/box/checker_verdict.err";

/// Command line convention of a compiled checker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerProtocol {
    /// `<checker> correct.in program.out correct.out`, testlib style
    Standard,
    /// `<checker> program.out correct.out correct.in`
    Legacy,
}

/// A checker program compiled once per problem and reused by every submission
pub struct CustomChecker {
    env: CheckerEnv,
    problem_id: i64,
    source: CheckerSource,
    protocol: CheckerProtocol,
    contestant_code: Vec<u8>,
}

impl CustomChecker {
    pub fn new(
        env: CheckerEnv,
        problem_id: i64,
        source: CheckerSource,
        protocol: CheckerProtocol,
        contestant_code: &str,
    ) -> Self {
        Self {
            env,
            problem_id,
            source,
            protocol,
            contestant_code: contestant_code.as_bytes().to_vec(),
        }
    }

    fn language(&self) -> Option<&Language> {
        self.env.languages.by_filename(&self.source.filename)
    }

    /// Whether a compiled checker newer than the source exists
    async fn is_fresh(&self) -> bool {
        let (bucket, key) = CheckerCache::artifact(self.problem_id);
        match self.env.scheduler.store().stat(bucket, &key).await {
            Ok(modified) => modified >= self.source.updated_at,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(problem_id = self.problem_id, "Checker stat error: {}", e);
                }
                false
            }
        }
    }

    fn request(&self, lang: &Language, subtest_id: i64, test_id: i64) -> ExecRequest {
        let config = get_config();
        let (bucket, key) = CheckerCache::artifact(self.problem_id);

        let input_bucket_files = HashMap::from([
            (
                "/box/program.out".to_string(),
                BucketFile::new(Bucket::Subtests, subtest_key(subtest_id), 0o644),
            ),
            (
                "/box/correct.in".to_string(),
                BucketFile::new(Bucket::Tests, test_input_key(test_id), 0o644),
            ),
            (
                "/box/correct.out".to_string(),
                BucketFile::new(Bucket::Tests, test_output_key(test_id), 0o644),
            ),
            (box_path(&lang.compiled_file), BucketFile::new(bucket, key, 0o755)),
        ]);
        let input_byte_files = HashMap::from([(
            "/box/contestant.txt".to_string(),
            ByteFile::new(self.contestant_code.clone(), 0o644),
        )]);

        let mut command = lang.run_command.clone();
        let (stderr_path, output_byte_files) = match self.protocol {
            CheckerProtocol::Standard => {
                command.extend(["/box/correct.in", "/box/program.out", "/box/correct.out"].map(String::from));
                (
                    Some(VERDICT_ERR.to_string()),
                    vec![VERDICT_OUT.to_string(), VERDICT_ERR.to_string()],
                )
            }
            CheckerProtocol::Legacy => {
                command.extend(["/box/program.out", "/box/correct.out", "/box/correct.in"].map(String::from));
                (None, vec![VERDICT_OUT.to_string()])
            }
        };

        ExecRequest {
            input_bucket_files,
            input_byte_files,
            command,
            run_config: RunConfig {
                output_path: Some(VERDICT_OUT.to_string()),
                stderr_path,
                wall_time_limit: config.checker_time_limit_secs(),
                memory_limit: config.checker_memory_limit_kb(),
                ..RunConfig::default()
            },
            output_byte_files,
            ..ExecRequest::default()
        }
    }

    async fn execute(&self, subtest_id: i64, test_id: i64) -> Result<CheckerOutcome, SandboxError> {
        let Some(lang) = self.language() else {
            return Ok(CheckerOutcome::failed());
        };

        let request = self.request(lang, subtest_id, test_id);
        let response = self.env.scheduler.run(&request).await?;
        debug!(
            problem_id = self.problem_id,
            subtest_id,
            "Checker exited with {:?} ({})",
            response.stats.status,
            response.stats.exit_code
        );

        let verdict = response.file(VERDICT_OUT).unwrap_or_default();
        let Some((percentage, mut message)) = parse_checker_output(verdict) else {
            return Ok(CheckerOutcome::new(WRONG_CHECKER_OUTPUT, Decimal::ZERO));
        };

        if message.is_empty() && self.protocol == CheckerProtocol::Standard {
            if let Some(stderr) = response.file(VERDICT_ERR) {
                message = String::from_utf8_lossy(stderr).trim().to_string();
            }
        }
        Ok(CheckerOutcome::new(message, percentage))
    }
}

#[async_trait]
impl Checker for CustomChecker {
    async fn prepare(&self) -> Result<(), PrepareError> {
        if self.is_fresh().await {
            debug!(problem_id = self.problem_id, "Using cached checker");
            return Ok(());
        }

        let lang = self
            .language()
            .ok_or_else(|| PrepareError::UnknownLanguage(self.source.filename.clone()))?;

        let lock = self.env.cache.lock_for(self.problem_id);
        let _guard = lock.write().await;

        // Someone else may have compiled it while we waited for the lock
        if self.is_fresh().await {
            debug!(problem_id = self.problem_id, "Using cached checker");
            return Ok(());
        }

        info!(problem_id = self.problem_id, "Compiling checker");
        self.env.cache.record_compilation();

        let mut header_files = HashMap::new();
        if let Some(testlib) = &self.env.testlib {
            header_files.insert("testlib.h".to_string(), testlib.to_vec());
        }
        let request = CompileRequest {
            id: -self.problem_id,
            code_files: HashMap::from([(lang.source_file.clone(), self.source.code.as_bytes().to_vec())]),
            header_files,
            lang,
        };

        let result = compile(&self.env.scheduler, &request)
            .await
            .map_err(|e| PrepareError::Infra(e.to_string()))?;

        if !result.success {
            return Err(PrepareError::Compile(format!(
                "Output:\n{}\nOther:\n{}",
                result.output, result.other
            )));
        }

        let duration = result.stats.map(|s| s.time).unwrap_or_default();
        info!(problem_id = self.problem_id, "Compiled checker in {:.2}s", duration);
        Ok(())
    }

    async fn run_checker(&self, subtest_id: i64, test_id: i64) -> CheckerOutcome {
        let lock = self.env.cache.lock_for(self.problem_id);
        let _guard = lock.read().await;

        match self.execute(subtest_id, test_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(problem_id = self.problem_id, subtest_id, "Checker failed: {}", e);
                CheckerOutcome::failed()
            }
        }
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        // Compiled checkers stay cached for the next submission
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::ERR_OUT;
    use crate::languages::Languages;
    use crate::sandbox::fake::{FakeBackend, Files};
    use crate::sandbox::RunStats;
    use crate::scheduler::BoxScheduler;
    use crate::storage::{ArtifactStore, MemoryStore, StoreError};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    const LANGUAGES: &str = r#"
[cpp]
extensions = ["cpp"]
source_file = "main.cpp"
compiled_file = "checker"
compile_command = "g++ -o /box/checker /box/main.cpp"
run_command = "/box/checker"
"#;

    /// Compiles by copying the source; runs by printing what the source says.
    /// A source "PRINT:<text>" makes the checker write <text> to stdout.
    fn checker_handler(command: &[String], _: &crate::sandbox::RunConfig, files: &mut Files) -> RunStats {
        if command[0] == "g++" {
            let source = files.get("/box/main.cpp").cloned().unwrap_or_default();
            if source.starts_with(b"BROKEN") {
                files.insert("/box/compile.err".into(), b"checker.cpp: error".to_vec());
                return RunStats {
                    exit_code: 1,
                    status: crate::sandbox::RunStatus::RuntimeError,
                    ..RunStats::default()
                };
            }
            files.insert("/box/checker".into(), source);
            return RunStats::default();
        }

        let binary = files.get("/box/checker").cloned().unwrap_or_default();
        let binary = String::from_utf8_lossy(&binary).to_string();
        let program_out = files.get("/box/program.out").cloned().unwrap_or_default();
        let verdict = match binary.strip_prefix("PRINT:") {
            Some(text) => text.to_string(),
            None => format!("{} {}", binary, String::from_utf8_lossy(&program_out)),
        };
        files.insert(VERDICT_OUT.into(), verdict.into_bytes());
        files.insert(VERDICT_ERR.into(), b"from stderr".to_vec());
        files.insert("/box/argv".into(), command.join(" ").into_bytes());
        RunStats::default()
    }

    struct Fixture {
        env: CheckerEnv,
        backend: Arc<FakeBackend>,
    }

    async fn fixture_with_store(store: Arc<dyn ArtifactStore>, delay: Option<Duration>) -> Fixture {
        let mut backend = FakeBackend::new(checker_handler);
        if let Some(delay) = delay {
            backend = backend.with_delay(delay);
        }
        let backend = Arc::new(backend);
        store.write(Bucket::Tests, "1.in", b"3 4").await.unwrap();
        store.write(Bucket::Tests, "1.out", b"7").await.unwrap();
        store.write(Bucket::Subtests, "100", b"7").await.unwrap();

        let scheduler = Arc::new(BoxScheduler::new(backend.clone(), store, 0, 8));
        Fixture {
            env: CheckerEnv {
                scheduler,
                languages: Arc::new(Languages::from_toml(LANGUAGES).unwrap()),
                cache: Arc::new(CheckerCache::new()),
                testlib: Some(Arc::from(&b"// testlib"[..])),
            },
            backend,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryStore::new()), None).await
    }

    fn source(code: &str) -> CheckerSource {
        CheckerSource {
            filename: "checker.cpp".into(),
            code: code.into(),
            updated_at: SystemTime::now() - Duration::from_secs(60),
        }
    }

    fn checker(fixture: &Fixture, code: &str, protocol: CheckerProtocol) -> CustomChecker {
        CustomChecker::new(fixture.env.clone(), 1, source(code), protocol, "int main() {}")
    }

    fn compile_count(backend: &FakeBackend) -> usize {
        backend.commands().iter().filter(|c| c[0] == "g++").count()
    }

    #[tokio::test]
    async fn test_prepare_twice_compiles_once() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "PRINT:100 ok", CheckerProtocol::Standard);

        checker.prepare().await.unwrap();
        checker.prepare().await.unwrap();

        assert_eq!(compile_count(&fixture.backend), 1);
        assert_eq!(fixture.env.cache.compilations(), 1);
    }

    #[tokio::test]
    async fn test_prepare_recompiles_stale_artifact() {
        let fixture = fixture().await;
        checker(&fixture, "PRINT:100 ok", CheckerProtocol::Standard)
            .prepare()
            .await
            .unwrap();

        let mut updated = source("PRINT:50 half");
        updated.updated_at = SystemTime::now() + Duration::from_secs(60);
        let checker = CustomChecker::new(fixture.env.clone(), 1, updated, CheckerProtocol::Standard, "");
        checker.prepare().await.unwrap();

        assert_eq!(compile_count(&fixture.backend), 2);
        assert_eq!(checker.run_checker(100, 1).await.percentage, dec!(50));
    }

    #[tokio::test]
    async fn test_concurrent_prepare_compiles_once() {
        let fixture = fixture_with_store(Arc::new(MemoryStore::new()), Some(Duration::from_millis(20))).await;
        let checker = Arc::new(checker(&fixture, "PRINT:100 ok", CheckerProtocol::Standard));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let checker = checker.clone();
                tokio::spawn(async move { checker.prepare().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(compile_count(&fixture.backend), 1);
    }

    #[tokio::test]
    async fn test_compile_failure_carries_diagnostics() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "BROKEN", CheckerProtocol::Standard);

        match checker.prepare().await {
            Err(PrepareError::Compile(message)) => assert!(message.contains("checker.cpp: error")),
            other => panic!("unexpected prepare result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_language() {
        let fixture = fixture().await;
        let mut src = source("x");
        src.filename = "checker.pas".into();
        let checker = CustomChecker::new(fixture.env.clone(), 1, src, CheckerProtocol::Legacy, "");

        assert!(matches!(checker.prepare().await, Err(PrepareError::UnknownLanguage(_))));
        assert_eq!(checker.run_checker(100, 1).await, CheckerOutcome::failed());
    }

    #[tokio::test]
    async fn test_standard_protocol() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "PRINT:87.5 Partial credit\n", CheckerProtocol::Standard);
        checker.prepare().await.unwrap();

        let outcome = checker.run_checker(100, 1).await;
        assert_eq!(outcome.percentage, dec!(87.5));
        assert_eq!(outcome.output, "Partial credit");

        let argv = fixture.backend.commands().pop().unwrap();
        assert_eq!(
            argv,
            vec!["/box/checker", "/box/correct.in", "/box/program.out", "/box/correct.out"]
        );
    }

    #[tokio::test]
    async fn test_standard_message_falls_back_to_stderr() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "PRINT:100", CheckerProtocol::Standard);
        checker.prepare().await.unwrap();

        let outcome = checker.run_checker(100, 1).await;
        assert_eq!(outcome.percentage, dec!(100));
        assert_eq!(outcome.output, "from stderr");
    }

    #[tokio::test]
    async fn test_legacy_protocol() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "PRINT:87.5 Partial credit\n", CheckerProtocol::Legacy);
        checker.prepare().await.unwrap();

        let outcome = checker.run_checker(100, 1).await;
        assert_eq!(outcome, CheckerOutcome::new("Partial credit", dec!(87.5)));

        let argv = fixture.backend.commands().pop().unwrap();
        assert_eq!(
            argv,
            vec!["/box/checker", "/box/program.out", "/box/correct.out", "/box/correct.in"]
        );
    }

    #[tokio::test]
    async fn test_malformed_output() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "PRINT:ok fine", CheckerProtocol::Legacy);
        checker.prepare().await.unwrap();

        let outcome = checker.run_checker(100, 1).await;
        assert_eq!(outcome.output, WRONG_CHECKER_OUTPUT);
        assert_eq!(outcome.percentage, dec!(0));
    }

    #[tokio::test]
    async fn test_missing_inputs_degrade_to_error_output() {
        let fixture = fixture().await;
        let checker = checker(&fixture, "PRINT:100 ok", CheckerProtocol::Standard);
        checker.prepare().await.unwrap();

        // No stored output for subtest 999
        let outcome = checker.run_checker(999, 1).await;
        assert_eq!(outcome.output, ERR_OUT);
        assert_eq!(outcome.percentage, dec!(0));
    }

    /// Writes checker binaries in two halves with a pause in between
    struct TornStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ArtifactStore for TornStore {
        async fn stat(&self, bucket: Bucket, key: &str) -> Result<SystemTime, StoreError> {
            self.inner.stat(bucket, key).await
        }

        async fn read(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.read(bucket, key).await
        }

        async fn write(&self, bucket: Bucket, key: &str, data: &[u8]) -> Result<(), StoreError> {
            if bucket == Bucket::Checkers {
                self.inner.write(bucket, key, &data[..data.len() / 2]).await?;
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            self.inner.write(bucket, key, data).await
        }

        async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StoreError> {
            self.inner.delete(bucket, key).await
        }
    }

    #[tokio::test]
    async fn test_executions_never_see_partial_binary() {
        let store = Arc::new(TornStore {
            inner: MemoryStore::new(),
        });
        let fixture = fixture_with_store(store, Some(Duration::from_millis(5))).await;

        // Binary text is the verdict prefix; a torn copy misses the score
        let code = "100";
        let old = checker(&fixture, code, CheckerProtocol::Legacy);
        old.prepare().await.unwrap();

        let mut fresh_source = source(code);
        fresh_source.updated_at = SystemTime::now() + Duration::from_secs(60);
        let recompiling = Arc::new(CustomChecker::new(
            fixture.env.clone(),
            1,
            fresh_source,
            CheckerProtocol::Legacy,
            "",
        ));
        let old = Arc::new(old);

        let prepare = {
            let checker = recompiling.clone();
            tokio::spawn(async move { checker.prepare().await })
        };
        let runs: Vec<_> = (0..16)
            .map(|_| {
                let checker = old.clone();
                tokio::spawn(async move { checker.run_checker(100, 1).await })
            })
            .collect();

        prepare.await.unwrap().unwrap();
        for run in runs {
            let outcome = run.await.unwrap();
            assert_eq!(outcome.percentage, dec!(100), "saw {:?}", outcome);
        }
    }
}
