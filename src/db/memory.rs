use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{Database, DbError, DbResult};
use crate::core::models::{
    Problem, Status, SubTask, SubTest, SubTestUpdate, Submission, SubmissionSubTask,
    SubmissionUpdate, Test, TestUpdate,
};

#[derive(Debug, Default)]
struct State {
    problems: BTreeMap<i64, Problem>,
    tests: BTreeMap<i64, Test>,
    subtasks: BTreeMap<i64, SubTask>,
    submissions: BTreeMap<i64, Submission>,
    subtests: BTreeMap<i64, SubTest>,
    submission_subtasks: BTreeMap<i64, SubmissionSubTask>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// `Database` held entirely in memory behind one lock
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: RwLock<State>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generated ids start after `last_id`
    pub fn starting_at(last_id: i64) -> Self {
        Self {
            state: RwLock::new(State {
                last_id,
                ..State::default()
            }),
        }
    }

    /// Replace a problem with its current tests and subtasks in one step.
    /// Tests and subtasks of the problem that are not listed are dropped.
    pub async fn replace_problem(&self, problem: Problem, tests: Vec<Test>, subtasks: Vec<SubTask>) {
        let mut state = self.state.write().await;
        let problem_id = problem.id;
        state.tests.retain(|_, t| t.problem_id != problem_id);
        state.subtasks.retain(|_, s| s.problem_id != problem_id);
        for test in tests {
            state.last_id = state.last_id.max(test.id);
            state.tests.insert(test.id, test);
        }
        for subtask in subtasks {
            state.last_id = state.last_id.max(subtask.id);
            state.subtasks.insert(subtask.id, subtask);
        }
        state.problems.insert(problem_id, problem);
    }

    /// Drop a submission together with its SubTests and SubmissionSubTasks
    pub async fn forget_submission(&self, id: i64) {
        let mut state = self.state.write().await;
        state.submissions.remove(&id);
        state.subtests.retain(|_, st| st.submission_id != id);
        state.submission_subtasks.retain(|_, st| st.submission_id != id);
    }

    /// Insert or replace a submission keeping its id
    pub async fn upsert_submission(&self, submission: Submission) {
        let mut state = self.state.write().await;
        state.last_id = state.last_id.max(submission.id);
        state.submissions.insert(submission.id, submission);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn problem(&self, id: i64) -> DbResult<Problem> {
        self.state
            .read()
            .await
            .problems
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound("problem", id))
    }

    async fn upsert_problem(&self, problem: Problem) -> DbResult<()> {
        self.state.write().await.problems.insert(problem.id, problem);
        Ok(())
    }

    async fn create_test(&self, mut test: Test) -> DbResult<i64> {
        if test.problem_id == 0 {
            return Err(DbError::MissingRequired("problem_id"));
        }
        let mut state = self.state.write().await;
        test.id = state.next_id();
        let id = test.id;
        state.tests.insert(id, test);
        Ok(id)
    }

    async fn test(&self, problem_id: i64, visible_id: i32) -> DbResult<Option<Test>> {
        Ok(self
            .state
            .read()
            .await
            .tests
            .values()
            .find(|t| t.problem_id == problem_id && t.visible_id == visible_id && !t.orphaned)
            .cloned())
    }

    async fn test_by_id(&self, id: i64) -> DbResult<Option<Test>> {
        Ok(self.state.read().await.tests.get(&id).cloned())
    }

    async fn tests(&self, problem_id: i64) -> DbResult<Vec<Test>> {
        let state = self.state.read().await;
        let mut tests: Vec<Test> = state
            .tests
            .values()
            .filter(|t| t.problem_id == problem_id && !t.orphaned)
            .cloned()
            .collect();
        tests.sort_by_key(|t| t.visible_id);
        Ok(tests)
    }

    async fn update_test(&self, id: i64, upd: TestUpdate) -> DbResult<()> {
        if upd.is_empty() {
            return Err(DbError::NoUpdates);
        }
        let mut state = self.state.write().await;
        let test = state.tests.get_mut(&id).ok_or(DbError::NotFound("test", id))?;
        if let Some(score) = upd.score {
            test.score = score;
        }
        if let Some(visible_id) = upd.visible_id {
            test.visible_id = visible_id;
        }
        if let Some(orphaned) = upd.orphaned {
            test.orphaned = orphaned;
        }
        Ok(())
    }

    async fn orphan_test(&self, id: i64) -> DbResult<()> {
        let mut state = self.state.write().await;
        let test = state.tests.get_mut(&id).ok_or(DbError::NotFound("test", id))?;
        test.orphaned = true;
        for subtask in state.subtasks.values_mut() {
            subtask.tests.retain(|&test_id| test_id != id);
        }
        Ok(())
    }

    async fn orphan_problem_tests(&self, problem_id: i64) -> DbResult<()> {
        let mut state = self.state.write().await;
        let mut orphaned = Vec::new();
        for test in state.tests.values_mut().filter(|t| t.problem_id == problem_id) {
            test.orphaned = true;
            orphaned.push(test.id);
        }
        for subtask in state.subtasks.values_mut() {
            subtask.tests.retain(|test_id| !orphaned.contains(test_id));
        }
        Ok(())
    }

    async fn biggest_vid(&self, problem_id: i64) -> DbResult<i32> {
        Ok(self
            .state
            .read()
            .await
            .tests
            .values()
            .filter(|t| t.problem_id == problem_id && !t.orphaned)
            .map(|t| t.visible_id)
            .max()
            .unwrap_or(0))
    }

    async fn create_subtask(&self, mut subtask: SubTask) -> DbResult<i64> {
        if subtask.problem_id == 0 {
            return Err(DbError::MissingRequired("problem_id"));
        }
        let mut state = self.state.write().await;
        subtask.id = state.next_id();
        let id = subtask.id;
        state.subtasks.insert(id, subtask);
        Ok(id)
    }

    async fn subtasks(&self, problem_id: i64) -> DbResult<Vec<SubTask>> {
        let state = self.state.read().await;
        let mut subtasks: Vec<SubTask> = state
            .subtasks
            .values()
            .filter(|s| s.problem_id == problem_id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.visible_id);
        Ok(subtasks)
    }

    async fn create_submission(&self, mut submission: Submission) -> DbResult<i64> {
        if submission.problem_id == 0 {
            return Err(DbError::MissingRequired("problem_id"));
        }
        let mut state = self.state.write().await;
        submission.id = state.next_id();
        let id = submission.id;
        state.submissions.insert(id, submission);
        Ok(id)
    }

    async fn submission(&self, id: i64) -> DbResult<Submission> {
        self.state
            .read()
            .await
            .submissions
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound("submission", id))
    }

    async fn update_submission(&self, id: i64, upd: SubmissionUpdate) -> DbResult<()> {
        if upd.is_empty() {
            return Err(DbError::NoUpdates);
        }
        let mut state = self.state.write().await;
        let sub = state
            .submissions
            .get_mut(&id)
            .ok_or(DbError::NotFound("submission", id))?;

        if let Some(status) = upd.status {
            if status != sub.status && !sub.status.can_transition_to(status) {
                return Err(DbError::InvalidTransition {
                    from: sub.status,
                    to: status,
                });
            }
            sub.status = status;
        }
        if let Some(score) = upd.score {
            sub.score = score;
        }
        if let Some(precision) = upd.score_precision {
            sub.score_precision = precision;
        }
        if let Some(compile_error) = upd.compile_error {
            sub.compile_error = Some(compile_error);
        }
        if let Some(message) = upd.compile_message {
            sub.compile_message = Some(message);
        }
        if let Some(message) = upd.internal_error {
            sub.internal_error = Some(message);
        }
        if let Some(max_time) = upd.max_time {
            sub.max_time = max_time;
        }
        if let Some(max_memory) = upd.max_memory {
            sub.max_memory = max_memory;
        }
        Ok(())
    }

    async fn claim_submission(&self, id: i64) -> DbResult<bool> {
        let mut state = self.state.write().await;
        let sub = state
            .submissions
            .get_mut(&id)
            .ok_or(DbError::NotFound("submission", id))?;
        if sub.status != Status::Waiting {
            return Ok(false);
        }
        sub.status = Status::Working;
        Ok(true)
    }

    async fn reset_submission(&self, id: i64) -> DbResult<()> {
        let mut state = self.state.write().await;
        let sub = state
            .submissions
            .get_mut(&id)
            .ok_or(DbError::NotFound("submission", id))?;
        sub.status = Status::Waiting;
        sub.score = Decimal::ZERO;
        sub.compile_error = None;
        sub.compile_message = None;
        sub.internal_error = None;
        sub.max_time = 0.0;
        sub.max_memory = 0;

        state.subtests.retain(|_, st| st.submission_id != id);
        state.submission_subtasks.retain(|_, st| st.submission_id != id);
        Ok(())
    }

    async fn waiting_submissions(&self, limit: usize) -> DbResult<Vec<Submission>> {
        let state = self.state.read().await;
        let mut waiting: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| s.status == Status::Waiting)
            .cloned()
            .collect();
        waiting.sort_by_key(|s| (s.created_at, s.id));
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn create_subtest(&self, mut subtest: SubTest) -> DbResult<i64> {
        if subtest.submission_id == 0 {
            return Err(DbError::MissingRequired("submission_id"));
        }
        let mut state = self.state.write().await;
        subtest.id = state.next_id();
        let id = subtest.id;
        state.subtests.insert(id, subtest);
        Ok(id)
    }

    async fn update_subtest(&self, id: i64, upd: SubTestUpdate) -> DbResult<()> {
        if upd.is_empty() {
            return Err(DbError::NoUpdates);
        }
        let mut state = self.state.write().await;
        let subtest = state
            .subtests
            .get_mut(&id)
            .ok_or(DbError::NotFound("subtest", id))?;
        if let Some(memory) = upd.memory {
            subtest.memory = memory;
        }
        if let Some(time) = upd.time {
            subtest.time = time;
        }
        if let Some(percentage) = upd.percentage {
            subtest.percentage = percentage;
        }
        if let Some(verdict) = upd.verdict {
            subtest.verdict = verdict;
        }
        if let Some(done) = upd.done {
            subtest.done = done;
        }
        Ok(())
    }

    async fn subtests(&self, submission_id: i64) -> DbResult<Vec<SubTest>> {
        let state = self.state.read().await;
        let mut subtests: Vec<SubTest> = state
            .subtests
            .values()
            .filter(|st| st.submission_id == submission_id)
            .cloned()
            .collect();
        subtests.sort_by_key(|st| st.visible_id);
        Ok(subtests)
    }

    async fn create_submission_subtask(&self, mut subtask: SubmissionSubTask) -> DbResult<i64> {
        if subtask.submission_id == 0 {
            return Err(DbError::MissingRequired("submission_id"));
        }
        let mut state = self.state.write().await;
        subtask.id = state.next_id();
        let id = subtask.id;
        state.submission_subtasks.insert(id, subtask);
        Ok(id)
    }

    async fn submission_subtasks(&self, submission_id: i64) -> DbResult<Vec<SubmissionSubTask>> {
        let state = self.state.read().await;
        let mut subtasks: Vec<SubmissionSubTask> = state
            .submission_subtasks
            .values()
            .filter(|st| st.submission_id == submission_id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|st| st.visible_id);
        Ok(subtasks)
    }
}
