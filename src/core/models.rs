//! Persisted records of the grading engine
//!
//! Sparse updates (`*Update`) carry only the fields that should change; a
//! persistence layer must reject an update that carries none.

use std::fmt;
use std::time::SystemTime;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default number of decimal places kept in a submission score
pub const DEFAULT_SCORE_PRECISION: u32 = 4;

/// Submission lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Code upload in progress
    #[default]
    Creating,
    /// Queued for a worker
    Waiting,
    /// Owned by a worker
    Working,
    /// Terminal; compile failures end here too
    Finished,
}

impl Status {
    /// Whether grading may move a submission from `self` to `next`.
    ///
    /// Only forward single steps are allowed. Going back to `Waiting` is an
    /// explicit reset (re-grade), not a transition.
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Creating, Status::Waiting)
                | (Status::Waiting, Status::Working)
                | (Status::Working, Status::Finished)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Waiting => "waiting",
            Status::Working => "working",
            Status::Finished => "finished",
        };
        write!(f, "{}", s)
    }
}

/// Reference test case of a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: i64,
    pub problem_id: i64,
    /// User-facing ordinal, unique among the problem's tests
    pub visible_id: i32,
    /// Weight used when the problem has no subtasks
    pub score: Decimal,
    #[serde(default)]
    pub orphaned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TestUpdate {
    pub score: Option<Decimal>,
    pub visible_id: Option<i32>,
    pub orphaned: Option<bool>,
}

impl TestUpdate {
    pub fn is_empty(&self) -> bool {
        self.score.is_none() && self.visible_id.is_none() && self.orphaned.is_none()
    }
}

/// Weighted group of tests scored by its worst member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: i64,
    pub problem_id: i64,
    pub visible_id: i32,
    pub score: Decimal,
    /// Member test ids
    pub tests: Vec<i64>,
}

/// Source of a compiled checker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerSource {
    /// File name; its extension selects the language
    pub filename: String,
    pub code: String,
    /// Last modification of the source; a cached binary older than this is stale
    pub updated_at: SystemTime,
}

/// Checker strategy configured for a problem
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckerSpec {
    #[default]
    Diff,
    Standard(CheckerSource),
    Legacy(CheckerSource),
}

fn default_test_name() -> String {
    "input".to_string()
}

fn default_score_precision() -> u32 {
    DEFAULT_SCORE_PRECISION
}

/// Grading-relevant view of a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    /// CPU time limit in seconds
    pub time_limit: f64,
    /// Memory limit in KB
    pub memory_limit: u64,
    /// Read stdin / write stdout instead of `<test_name>.in` / `<test_name>.out`
    #[serde(default = "default_console_input")]
    pub console_input: bool,
    #[serde(default = "default_test_name")]
    pub test_name: String,
    #[serde(default = "default_score_precision")]
    pub score_precision: u32,
    /// Added to every graded (non compile-error) submission
    #[serde(default)]
    pub default_points: Decimal,
    #[serde(default)]
    pub checker: CheckerSpec,
}

fn default_console_input() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub created_at: SystemTime,
    pub user_id: i64,
    pub problem_id: i64,
    pub language: String,
    pub code: String,
    pub code_size: usize,
    pub status: Status,

    pub compile_error: Option<bool>,
    pub compile_message: Option<String>,
    /// Submission-fatal infrastructure failure, distinct from a compile error
    pub internal_error: Option<String>,

    pub contest_id: Option<i64>,

    /// Seconds
    pub max_time: f64,
    /// KB
    pub max_memory: u64,

    pub score: Decimal,
    pub score_precision: u32,
}

impl Submission {
    /// A fresh submission in `creating`, not yet persisted
    pub fn new(
        user_id: i64,
        problem_id: i64,
        language: impl Into<String>,
        code: impl Into<String>,
        contest_id: Option<i64>,
    ) -> Self {
        let code = code.into();
        Self {
            id: 0,
            created_at: SystemTime::now(),
            user_id,
            problem_id,
            language: language.into(),
            code_size: code.len(),
            code,
            status: Status::Creating,
            compile_error: None,
            compile_message: None,
            internal_error: None,
            contest_id,
            max_time: 0.0,
            max_memory: 0,
            score: Decimal::ZERO,
            score_precision: DEFAULT_SCORE_PRECISION,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionUpdate {
    pub status: Option<Status>,
    pub score: Option<Decimal>,
    pub score_precision: Option<u32>,

    pub compile_error: Option<bool>,
    pub compile_message: Option<String>,
    pub internal_error: Option<String>,

    pub max_time: Option<f64>,
    pub max_memory: Option<u64>,
}

impl SubmissionUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.score.is_none()
            && self.score_precision.is_none()
            && self.compile_error.is_none()
            && self.compile_message.is_none()
            && self.internal_error.is_none()
            && self.max_time.is_none()
            && self.max_memory.is_none()
    }
}

/// Execution record of one test against one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTest {
    pub id: i64,
    pub created_at: SystemTime,
    pub done: bool,
    pub verdict: String,
    /// Seconds
    pub time: f64,
    /// KB
    pub memory: u64,
    pub percentage: Decimal,
    pub test_id: Option<i64>,
    pub user_id: i64,
    pub submission_id: i64,
    pub contest_id: Option<i64>,
    pub visible_id: i32,
    /// Weight of the referenced test at grading time
    pub score: Decimal,
}

impl SubTest {
    /// Pending record for `test` of `submission`
    pub fn pending(submission: &Submission, test: &Test) -> Self {
        Self {
            id: 0,
            created_at: SystemTime::now(),
            done: false,
            verdict: String::new(),
            time: 0.0,
            memory: 0,
            percentage: Decimal::ZERO,
            test_id: Some(test.id),
            user_id: submission.user_id,
            submission_id: submission.id,
            contest_id: submission.contest_id,
            visible_id: test.visible_id,
            score: test.score,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubTestUpdate {
    pub memory: Option<u64>,
    pub time: Option<f64>,
    pub percentage: Option<Decimal>,
    pub verdict: Option<String>,
    pub done: Option<bool>,
}

impl SubTestUpdate {
    pub fn is_empty(&self) -> bool {
        self.memory.is_none()
            && self.time.is_none()
            && self.percentage.is_none()
            && self.verdict.is_none()
            && self.done.is_none()
    }
}

/// Aggregated result of one subtask for one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSubTask {
    pub id: i64,
    pub created_at: SystemTime,

    pub submission_id: i64,
    pub user_id: i64,
    pub subtask_id: Option<i64>,

    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub visible_id: i32,

    pub score: Decimal,
    /// Worst member percentage, before weighting
    pub final_percentage: Option<Decimal>,

    pub score_precision: u32,

    /// Member subtest ids, in test order
    pub subtests: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_forward_only() {
        assert!(Status::Creating.can_transition_to(Status::Waiting));
        assert!(Status::Waiting.can_transition_to(Status::Working));
        assert!(Status::Working.can_transition_to(Status::Finished));

        assert!(!Status::Working.can_transition_to(Status::Waiting));
        assert!(!Status::Finished.can_transition_to(Status::Working));
        assert!(!Status::Creating.can_transition_to(Status::Working));
    }

    #[test]
    fn test_checker_spec_serde() {
        let spec: CheckerSpec = serde_json::from_str(r#"{"kind":"diff"}"#).unwrap();
        assert_eq!(spec, CheckerSpec::Diff);

        let json = r#"{"kind":"legacy","filename":"checker.cpp","code":"int main(){}","updated_at":{"secs_since_epoch":10,"nanos_since_epoch":0}}"#;
        match serde_json::from_str::<CheckerSpec>(json).unwrap() {
            CheckerSpec::Legacy(src) => assert_eq!(src.filename, "checker.cpp"),
            other => panic!("unexpected checker spec: {:?}", other),
        }
    }

    #[test]
    fn test_empty_updates() {
        assert!(TestUpdate::default().is_empty());
        assert!(SubTestUpdate::default().is_empty());
        assert!(SubmissionUpdate::default().is_empty());
        assert!(!TestUpdate {
            orphaned: Some(true),
            ..Default::default()
        }
        .is_empty());
    }
}
