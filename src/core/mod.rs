//! Core domain types shared by every layer of the grader
//!
//! - `models`: persisted records (tests, submissions, subtests, subtasks)
//! - `verdict`: verdict strings for contestant-attributable run failures
//! - `score`: fixed-point score arithmetic and aggregation rules

pub mod models;
pub mod score;
pub mod verdict;
