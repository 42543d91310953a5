//! Grading pipeline
//!
//! `grade` takes a `waiting` submission through compilation, checker
//! preparation, concurrent test execution and score aggregation, leaving it
//! `finished`. Contestant failures (time limit, runtime error, ...) are
//! recorded as SubTest verdicts; infrastructure failures end the submission
//! with `internal_error` set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checker::{build_checker, Checker, CheckerCache, CheckerEnv};
use crate::compiler::{artifact_location, clean_compilation, compile, CompileRequest};
use crate::core::models::{
    Problem, Status, SubTest, SubTestUpdate, Submission, SubmissionSubTask, SubmissionUpdate, Test,
};
use crate::core::score::{submission_score, subtask_score, weighted};
use crate::core::verdict::Verdict;
use crate::db::Database;
use crate::error::{GradeError, GradeResult};
use crate::languages::{Language, Languages};
use crate::sandbox::{box_path, RunConfig, RunStatus, SandboxError};
use crate::scheduler::{BoxScheduler, BucketFile, ExecRequest};
use crate::storage::{subtest_key, test_input_key, Bucket};

const CONSOLE_STDIN: &str = "/box/stdin.in";
const CONSOLE_STDOUT: &str = "/box/stdout.out";
const PROGRAM_STDERR: &str = "/box/stderr.out";

/// Submission with everything graded for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub submission: Submission,
    pub subtests: Vec<SubTest>,
    pub subtasks: Vec<SubmissionSubTask>,
}

/// Result of one test run, as written to its SubTest
#[derive(Debug, Clone, PartialEq)]
struct TestRun {
    verdict: String,
    time: f64,
    memory: u64,
    percentage: Decimal,
}

impl TestRun {
    fn failed(verdict: Verdict, time: f64, memory: u64) -> Self {
        Self {
            verdict: verdict.to_string(),
            time,
            memory,
            percentage: Decimal::ZERO,
        }
    }
}

pub struct Grader {
    db: Arc<dyn Database>,
    scheduler: Arc<BoxScheduler>,
    languages: Arc<Languages>,
    checkers: CheckerEnv,
}

impl Grader {
    pub fn new(
        db: Arc<dyn Database>,
        scheduler: Arc<BoxScheduler>,
        languages: Arc<Languages>,
        cache: Arc<CheckerCache>,
        testlib: Option<Arc<[u8]>>,
    ) -> Self {
        let checkers = CheckerEnv {
            scheduler: scheduler.clone(),
            languages: languages.clone(),
            cache,
            testlib,
        };
        Self {
            db,
            scheduler,
            languages,
            checkers,
        }
    }

    fn language(&self, name: &str) -> GradeResult<&Language> {
        let lang = self
            .languages
            .get(name)
            .ok_or_else(|| GradeError::UnknownLanguage(name.to_string()))?;
        if lang.disabled {
            return Err(GradeError::LanguageDisabled(lang.name.clone()));
        }
        Ok(lang)
    }

    /// Create a submission and queue it for grading
    pub async fn submit(
        &self,
        user_id: i64,
        problem_id: i64,
        language: &str,
        code: &str,
        contest_id: Option<i64>,
    ) -> GradeResult<i64> {
        let lang = self.language(language)?;
        self.db.problem(problem_id).await?;

        let submission = Submission::new(user_id, problem_id, lang.name.clone(), code, contest_id);
        let id = self.db.create_submission(submission).await?;
        self.db
            .update_submission(
                id,
                SubmissionUpdate {
                    status: Some(Status::Waiting),
                    ..Default::default()
                },
            )
            .await?;

        info!(submission_id = id, problem_id, "Submission {} queued ({})", id, lang.name);
        Ok(id)
    }

    /// Grade a waiting submission.
    ///
    /// Any error ends the submission as `finished` with `internal_error` set,
    /// except when it was not waiting in the first place.
    pub async fn grade(&self, id: i64, cancel: &CancellationToken) -> GradeResult<()> {
        if !self.db.claim_submission(id).await? {
            let current = self.db.submission(id).await?;
            return Err(GradeError::InvalidState {
                id,
                status: current.status,
                expected: Status::Waiting,
            });
        }
        let submission = self.db.submission(id).await?;
        info!(submission_id = id, "Grading submission {}", id);

        let result = tokio::select! {
            result = self.grade_claimed(&submission) => result,
            _ = cancel.cancelled() => Err(GradeError::Cancelled),
        };

        if let Err(e) = &result {
            error!(submission_id = id, "Grading failed: {}", e);
            self.fail(id, e).await;
        }

        if let Err(e) = clean_compilation(self.scheduler.store().as_ref(), id).await {
            warn!(submission_id = id, "Couldn't remove compilation: {}", e);
        }
        result
    }

    async fn fail(&self, id: i64, err: &GradeError) {
        let upd = SubmissionUpdate {
            status: Some(Status::Finished),
            score: Some(Decimal::ZERO),
            internal_error: Some(err.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.db.update_submission(id, upd).await {
            error!(submission_id = id, "Couldn't record grading failure: {}", e);
        }
    }

    async fn grade_claimed(&self, sub: &Submission) -> GradeResult<()> {
        let problem = self.db.problem(sub.problem_id).await?;
        let lang = self.language(&sub.language)?;

        let compiled = compile(
            &self.scheduler,
            &CompileRequest {
                id: sub.id,
                code_files: HashMap::from([(lang.source_file.clone(), sub.code.as_bytes().to_vec())]),
                header_files: HashMap::new(),
                lang,
            },
        )
        .await?;

        if !compiled.success {
            info!(submission_id = sub.id, "Compile error");
            self.db
                .update_submission(
                    sub.id,
                    SubmissionUpdate {
                        status: Some(Status::Finished),
                        score: Some(Decimal::ZERO),
                        compile_error: Some(true),
                        compile_message: Some(compiled.message()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }
        self.db
            .update_submission(
                sub.id,
                SubmissionUpdate {
                    compile_error: Some(false),
                    compile_message: Some(compiled.message()),
                    ..Default::default()
                },
            )
            .await?;

        let checker = build_checker(&problem.checker, &self.checkers, problem.id, &sub.code);
        checker.prepare().await?;

        let tests = self.db.tests(problem.id).await?;
        let mut pending = Vec::with_capacity(tests.len());
        for test in &tests {
            let mut subtest = SubTest::pending(sub, test);
            subtest.id = self.db.create_subtest(subtest.clone()).await?;
            pending.push((subtest, test));
        }

        // Boxed so the grading future stays Send for spawned workers
        let mut runs: Vec<BoxFuture<'_, GradeResult<()>>> = Vec::with_capacity(pending.len());
        for (subtest, test) in pending {
            runs.push(self.run_test(sub, &problem, lang, checker.as_ref(), subtest, test).boxed());
        }
        stream::iter(runs)
            .buffer_unordered(self.scheduler.size())
            .try_collect::<Vec<()>>()
            .await?;

        if let Err(e) = checker.cleanup().await {
            warn!(submission_id = sub.id, "Checker cleanup failed: {:#}", e);
        }

        self.finish(sub, &problem).await
    }

    /// Run one test and record its SubTest. Only scheduler allocation
    /// failures escape; everything else is this test's verdict.
    async fn run_test(
        &self,
        sub: &Submission,
        problem: &Problem,
        lang: &Language,
        checker: &dyn Checker,
        subtest: SubTest,
        test: &Test,
    ) -> GradeResult<()> {
        let run = match self.execute_test(sub, problem, lang, checker, &subtest, test).await {
            Ok(run) => run,
            Err(e) if e.is_allocation() => return Err(e.into()),
            Err(e) => {
                warn!(submission_id = sub.id, test_id = test.id, "Test execution failed: {}", e);
                TestRun::failed(Verdict::InternalError, 0.0, 0)
            }
        };
        debug!(
            submission_id = sub.id,
            test = test.visible_id,
            "Test {}: {} ({}%)",
            test.visible_id,
            run.verdict,
            run.percentage
        );

        self.db
            .update_subtest(
                subtest.id,
                SubTestUpdate {
                    memory: Some(run.memory),
                    time: Some(run.time),
                    percentage: Some(run.percentage),
                    verdict: Some(run.verdict),
                    done: Some(true),
                },
            )
            .await?;
        Ok(())
    }

    async fn execute_test(
        &self,
        sub: &Submission,
        problem: &Problem,
        lang: &Language,
        checker: &dyn Checker,
        subtest: &SubTest,
        test: &Test,
    ) -> Result<TestRun, SandboxError> {
        let (input, output) = if problem.console_input {
            (CONSOLE_STDIN.to_string(), CONSOLE_STDOUT.to_string())
        } else {
            (
                box_path(&format!("{}.in", problem.test_name)),
                box_path(&format!("{}.out", problem.test_name)),
            )
        };

        let time_limit = lang.calculate_time_limit(problem.time_limit);
        let memory_limit = lang.calculate_memory_limit(problem.memory_limit);
        let (bucket, key) = artifact_location(sub.id);

        let request = ExecRequest {
            input_bucket_files: HashMap::from([
                (box_path(&lang.compiled_file), BucketFile::new(bucket, key, 0o755)),
                (input.clone(), BucketFile::new(Bucket::Tests, test_input_key(test.id), 0o644)),
            ]),
            command: lang.run_command.clone(),
            run_config: RunConfig {
                input_path: problem.console_input.then(|| input.clone()),
                output_path: problem.console_input.then(|| output.clone()),
                stderr_path: Some(PROGRAM_STDERR.to_string()),
                time_limit,
                wall_time_limit: time_limit * 2.0 + 1.0,
                memory_limit,
                ..RunConfig::default()
            },
            output_bucket_files: HashMap::from([(
                output.clone(),
                BucketFile::new(Bucket::Subtests, subtest_key(subtest.id), 0o644),
            )]),
            ..ExecRequest::default()
        };

        let response = self.scheduler.run(&request).await?;
        let stats = &response.stats;

        let verdict = match stats.status {
            RunStatus::TimedOut => Verdict::TimeLimitExceeded,
            _ if memory_limit > 0 && stats.memory > memory_limit => Verdict::MemoryLimitExceeded,
            RunStatus::Signaled(sig) => Verdict::Signaled(sig),
            RunStatus::RuntimeError => Verdict::RuntimeError(stats.exit_code),
            _ if stats.exit_code != 0 => Verdict::RuntimeError(stats.exit_code),
            RunStatus::InternalError => Verdict::InternalError,
            RunStatus::Ok if !response.stored.contains(&output) => Verdict::MissingOutput,
            RunStatus::Ok => Verdict::Ok,
        };
        if !verdict.is_ok() {
            return Ok(TestRun::failed(verdict, stats.time, stats.memory));
        }

        let outcome = checker.run_checker(subtest.id, test.id).await;
        Ok(TestRun {
            verdict: outcome.output,
            time: stats.time,
            memory: stats.memory,
            percentage: outcome.percentage,
        })
    }

    /// Aggregate SubTests into subtask and submission scores
    async fn finish(&self, sub: &Submission, problem: &Problem) -> GradeResult<()> {
        let subtests = self.db.subtests(sub.id).await?;
        let subtasks = self.db.subtasks(problem.id).await?;
        let precision = problem.score_precision;

        let parts: Vec<Decimal> = if subtasks.is_empty() {
            subtests
                .iter()
                .map(|st| weighted(st.score, st.percentage))
                .collect()
        } else {
            let mut parts = Vec::with_capacity(subtasks.len());
            for subtask in &subtasks {
                let members: HashSet<i64> = subtask.tests.iter().copied().collect();
                // subtests are ordered by visible id
                let graded: Vec<&SubTest> = subtests
                    .iter()
                    .filter(|st| st.test_id.is_some_and(|tid| members.contains(&tid)))
                    .collect();
                let percentages: Vec<Decimal> = graded.iter().map(|st| st.percentage).collect();
                let result = subtask_score(subtask.score, &percentages, precision);

                self.db
                    .create_submission_subtask(SubmissionSubTask {
                        id: 0,
                        created_at: std::time::SystemTime::now(),
                        submission_id: sub.id,
                        user_id: sub.user_id,
                        subtask_id: Some(subtask.id),
                        problem_id: problem.id,
                        contest_id: sub.contest_id,
                        visible_id: subtask.visible_id,
                        score: subtask.score,
                        final_percentage: result.final_percentage,
                        score_precision: precision,
                        subtests: graded.iter().map(|st| st.id).collect(),
                    })
                    .await?;
                parts.push(result.score);
            }
            parts
        };

        let score = submission_score(parts, problem.default_points, precision);
        let max_time = subtests.iter().map(|st| st.time).fold(0.0, f64::max);
        let max_memory = subtests.iter().map(|st| st.memory).max().unwrap_or(0);

        self.db
            .update_submission(
                sub.id,
                SubmissionUpdate {
                    status: Some(Status::Finished),
                    score: Some(score),
                    score_precision: Some(precision),
                    max_time: Some(max_time),
                    max_memory: Some(max_memory),
                    ..Default::default()
                },
            )
            .await?;

        info!(submission_id = sub.id, "Submission {} finished with score {}", sub.id, score);
        Ok(())
    }

    /// Send a finished submission back to `waiting`, discarding its results
    pub async fn regrade(&self, id: i64) -> GradeResult<()> {
        let submission = self.db.submission(id).await?;
        if submission.status != Status::Finished {
            return Err(GradeError::InvalidState {
                id,
                status: submission.status,
                expected: Status::Finished,
            });
        }
        self.db.reset_submission(id).await?;
        info!(submission_id = id, "Submission {} reset for regrading", id);
        Ok(())
    }

    pub async fn submission_report(&self, id: i64) -> GradeResult<SubmissionReport> {
        Ok(SubmissionReport {
            submission: self.db.submission(id).await?,
            subtests: self.db.subtests(id).await?,
            subtasks: self.db.submission_subtasks(id).await?,
        })
    }
}
