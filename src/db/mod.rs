//! Persistence boundary of the grading engine
//!
//! The relational store lives outside this crate. `Database` is the subset
//! of its CRUD surface the grader reads and writes; `MemoryDatabase` is the
//! implementation used by the worker (seeded per job) and by tests.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::models::{
    Problem, Status, SubTask, SubTest, SubTestUpdate, Submission, SubmissionSubTask,
    SubmissionUpdate, Test, TestUpdate,
};

pub use memory::MemoryDatabase;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),

    /// A sparse update carried no fields
    #[error("no fields to update")]
    NoUpdates,

    #[error("missing required field: {0}")]
    MissingRequired(&'static str),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("database error: {0}")]
    Other(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[async_trait]
pub trait Database: Send + Sync {
    // Problems

    async fn problem(&self, id: i64) -> DbResult<Problem>;
    async fn upsert_problem(&self, problem: Problem) -> DbResult<()>;

    // Tests

    /// Insert a test and return its id
    async fn create_test(&self, test: Test) -> DbResult<i64>;
    /// Non-orphaned test of `problem_id` with the given visible id
    async fn test(&self, problem_id: i64, visible_id: i32) -> DbResult<Option<Test>>;
    /// Any test, orphaned or not
    async fn test_by_id(&self, id: i64) -> DbResult<Option<Test>>;
    /// Non-orphaned tests of a problem, ordered by visible id
    async fn tests(&self, problem_id: i64) -> DbResult<Vec<Test>>;
    async fn update_test(&self, id: i64, upd: TestUpdate) -> DbResult<()>;
    /// Mark orphaned and detach from every subtask, as one operation
    async fn orphan_test(&self, id: i64) -> DbResult<()>;
    async fn orphan_problem_tests(&self, problem_id: i64) -> DbResult<()>;
    /// Largest visible id among non-orphaned tests, 0 when there are none
    async fn biggest_vid(&self, problem_id: i64) -> DbResult<i32>;

    // Subtasks

    async fn create_subtask(&self, subtask: SubTask) -> DbResult<i64>;
    /// Subtasks of a problem, ordered by visible id
    async fn subtasks(&self, problem_id: i64) -> DbResult<Vec<SubTask>>;

    // Submissions

    async fn create_submission(&self, submission: Submission) -> DbResult<i64>;
    async fn submission(&self, id: i64) -> DbResult<Submission>;
    /// Apply a sparse update; a status change must be a legal transition
    async fn update_submission(&self, id: i64, upd: SubmissionUpdate) -> DbResult<()>;
    /// Atomically move a `waiting` submission to `working`; false if it was not waiting
    async fn claim_submission(&self, id: i64) -> DbResult<bool>;
    /// Back to `waiting` with results and grading fields discarded (re-grade)
    async fn reset_submission(&self, id: i64) -> DbResult<()>;
    /// Oldest first
    async fn waiting_submissions(&self, limit: usize) -> DbResult<Vec<Submission>>;

    // Subtests

    async fn create_subtest(&self, subtest: SubTest) -> DbResult<i64>;
    async fn update_subtest(&self, id: i64, upd: SubTestUpdate) -> DbResult<()>;
    /// Subtests of a submission, ordered by visible id
    async fn subtests(&self, submission_id: i64) -> DbResult<Vec<SubTest>>;

    // Submission subtasks

    async fn create_submission_subtask(&self, subtask: SubmissionSubTask) -> DbResult<i64>;
    async fn submission_subtasks(&self, submission_id: i64) -> DbResult<Vec<SubmissionSubTask>>;
}
