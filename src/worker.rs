//! Queue worker - grades jobs received from Redis
//!
//! A job carries the submission together with the problem, its tests and
//! subtasks as they are at submit time. The worker keeps them in a shared
//! `MemoryDatabase` while the submission is graded and forgets the
//! submission once its report is built.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checker::CheckerCache;
use crate::core::models::{Problem, Status, SubTask, Submission, Test};
use crate::db::{Database, MemoryDatabase};
use crate::error::{GradeError, GradeResult};
use crate::grader::{Grader, SubmissionReport};
use crate::languages::Languages;
use crate::scheduler::BoxScheduler;

/// Job received from the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeJob {
    pub submission: Submission,
    pub problem: Problem,
    #[serde(default)]
    pub tests: Vec<Test>,
    #[serde(default)]
    pub subtasks: Vec<SubTask>,
}

pub struct Worker {
    db: Arc<MemoryDatabase>,
    grader: Grader,
}

impl Worker {
    /// `id_base` keeps SubTest ids (and their stored outputs) of different
    /// worker runs apart
    pub fn new(
        scheduler: Arc<BoxScheduler>,
        languages: Arc<Languages>,
        cache: Arc<CheckerCache>,
        testlib: Option<Arc<[u8]>>,
        id_base: i64,
    ) -> Self {
        let db = Arc::new(MemoryDatabase::starting_at(id_base));
        let grader = Grader::new(db.clone(), scheduler, languages, cache, testlib);
        Self { db, grader }
    }

    /// Grade one job and build its report.
    ///
    /// Grading failures are part of the report (`internal_error`). Fails only
    /// when the submission is already being graded by this worker.
    pub async fn process_job(&self, job: GradeJob, cancel: &CancellationToken) -> GradeResult<SubmissionReport> {
        let id = job.submission.id;
        if let Ok(current) = self.db.submission(id).await {
            return Err(GradeError::InvalidState {
                id,
                status: current.status,
                expected: Status::Waiting,
            });
        }
        info!(
            submission_id = id,
            problem_id = job.problem.id,
            "Received grading job: {} tests, {} subtasks",
            job.tests.len(),
            job.subtasks.len()
        );

        self.db.replace_problem(job.problem, job.tests, job.subtasks).await;
        self.db.upsert_submission(waiting(job.submission)).await;

        let graded = self.grader.grade(id, cancel).await;
        let report = self.grader.submission_report(id).await;
        self.db.forget_submission(id).await;

        if let Err(e) = graded {
            warn!(submission_id = id, "Submission ended with internal error: {}", e);
        }
        report
    }
}

/// The submission as a fresh grading request
fn waiting(mut submission: Submission) -> Submission {
    submission.status = Status::Waiting;
    submission.score = Decimal::ZERO;
    submission.compile_error = None;
    submission.compile_message = None;
    submission.internal_error = None;
    submission.max_time = 0.0;
    submission.max_memory = 0;
    submission
}
