//! Grading engine for an online judge
//!
//! Submissions are compiled and run inside sandboxes drawn from a bounded
//! pool, scored test by test by a checker, and aggregated into subtask and
//! submission scores.

pub mod checker;
pub mod compiler;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod grader;
pub mod languages;
pub mod redis_manager;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use error::{GradeError, GradeResult};
pub use grader::{Grader, SubmissionReport};
