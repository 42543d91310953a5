//! Checker module - scoring contestant output
//!
//! Three strategies share the `Checker` contract:
//! - `Standard`: testlib-style program, `<checker> correct.in program.out correct.out`
//! - `Legacy`: positional program, `<checker> program.out correct.out correct.in`
//! - `Diff`: in-process comparison with the reference output
//!
//! Compiled checkers are cached per problem in the artifact store and guarded
//! by the `CheckerCache` readers-writer locks.

pub mod cache;
pub mod custom;
pub mod diff;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::core::models::CheckerSpec;
use crate::core::score::clamp_percentage;
use crate::languages::Languages;
use crate::scheduler::BoxScheduler;

pub use cache::CheckerCache;
pub use custom::{CheckerProtocol, CustomChecker};
pub use diff::{compare_output, DiffChecker};

/// Output reported when a checker could not be run at all
pub const ERR_OUT: &str = "Internal checker error";
/// Output reported when a checker's first token is not a number
pub const WRONG_CHECKER_OUTPUT: &str = "Wrong checker output";

/// Verdict of one checker invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerOutcome {
    pub output: String,
    /// In [0, 100]
    pub percentage: Decimal,
}

impl CheckerOutcome {
    pub fn new(output: impl Into<String>, percentage: Decimal) -> Self {
        Self {
            output: output.into(),
            percentage: clamp_percentage(percentage),
        }
    }

    /// The checker failed; the test earns nothing
    pub fn failed() -> Self {
        Self::new(ERR_OUT, Decimal::ZERO)
    }
}

#[derive(Debug, Error)]
pub enum PrepareError {
    /// The checker source does not compile; carries the compiler diagnostics
    #[error("invalid checker code:\n{0}")]
    Compile(String),

    #[error("no language for checker file {0:?}")]
    UnknownLanguage(String),

    #[error("couldn't compile checker: {0}")]
    Infra(String),
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// One-time work before the first `run_checker`; idempotent
    async fn prepare(&self) -> Result<(), PrepareError>;

    /// Score the output of subtest `subtest_id` against test `test_id`.
    /// Never fails: problems become `CheckerOutcome::failed()`.
    async fn run_checker(&self, subtest_id: i64, test_id: i64) -> CheckerOutcome;

    /// Release per-submission state
    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// What checkers of every problem share
#[derive(Clone)]
pub struct CheckerEnv {
    pub scheduler: Arc<BoxScheduler>,
    pub languages: Arc<Languages>,
    pub cache: Arc<CheckerCache>,
    /// testlib.h, staged next to standard checker sources
    pub testlib: Option<Arc<[u8]>>,
}

/// The checker configured for a problem
pub fn build_checker(
    spec: &CheckerSpec,
    env: &CheckerEnv,
    problem_id: i64,
    contestant_code: &str,
) -> Box<dyn Checker> {
    match spec {
        CheckerSpec::Diff => Box::new(DiffChecker::new(env.scheduler.store().clone())),
        CheckerSpec::Standard(source) => Box::new(CustomChecker::new(
            env.clone(),
            problem_id,
            source.clone(),
            CheckerProtocol::Standard,
            contestant_code,
        )),
        CheckerSpec::Legacy(source) => Box::new(CustomChecker::new(
            env.clone(),
            problem_id,
            source.clone(),
            CheckerProtocol::Legacy,
            contestant_code,
        )),
    }
}

/// Split checker output into its leading percentage and the message after it.
/// `None` when the first token is not a number.
///
/// The whole first token must be numeric: `87.5abc` is rejected rather than
/// read as 87.5, so a checker printing garbage never awards points.
pub fn parse_checker_output(raw: &[u8]) -> Option<(Decimal, String)> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_start();
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    let (token, rest) = text.split_at(end);

    let percentage = parse_percentage(token)?;
    Some((clamp_percentage(percentage), rest.trim().to_string()))
}

fn parse_percentage(token: &str) -> Option<Decimal> {
    if token.is_empty() {
        return None;
    }
    Decimal::from_str(token)
        .or_else(|_| Decimal::from_scientific(token))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_partial_credit() {
        let (percentage, message) = parse_checker_output(b"87.5 Partial credit\n").unwrap();
        assert_eq!(percentage, dec!(87.5));
        assert_eq!(message, "Partial credit");
    }

    #[test]
    fn test_parse_without_numeral() {
        assert!(parse_checker_output(b"ok Correct\n").is_none());
        assert!(parse_checker_output(b"").is_none());
        assert!(parse_checker_output(b"   \n").is_none());
    }

    #[test]
    fn test_parse_rejects_numeric_prefix() {
        assert!(parse_checker_output(b"87.5abc").is_none());
        assert!(parse_checker_output(b"100%").is_none());
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        let (percentage, message) = parse_checker_output(b"\n  100\n\nAccepted  \n").unwrap();
        assert_eq!(percentage, dec!(100));
        assert_eq!(message, "Accepted");

        let (percentage, message) = parse_checker_output(b"0").unwrap();
        assert_eq!(percentage, dec!(0));
        assert_eq!(message, "");
    }

    #[test]
    fn test_parse_clamps_and_scientific() {
        assert_eq!(parse_checker_output(b"150 too much").unwrap().0, dec!(100));
        assert_eq!(parse_checker_output(b"-3 negative").unwrap().0, dec!(0));
        assert_eq!(parse_checker_output(b"5e1 half").unwrap().0, dec!(50));
    }

    #[test]
    fn test_failed_outcome() {
        let outcome = CheckerOutcome::failed();
        assert_eq!(outcome.output, ERR_OUT);
        assert_eq!(outcome.percentage, Decimal::ZERO);
    }
}
