//! Diff checker - whitespace-tolerant comparison with the reference output

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use super::{Checker, CheckerOutcome, PrepareError};
use crate::storage::{subtest_key, test_output_key, ArtifactStore, Bucket};

pub struct DiffChecker {
    store: Arc<dyn ArtifactStore>,
}

impl DiffChecker {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Checker for DiffChecker {
    async fn prepare(&self) -> Result<(), PrepareError> {
        Ok(())
    }

    async fn run_checker(&self, subtest_id: i64, test_id: i64) -> CheckerOutcome {
        let actual = self.store.read(Bucket::Subtests, &subtest_key(subtest_id)).await;
        let expected = self.store.read(Bucket::Tests, &test_output_key(test_id)).await;

        let (actual, expected) = match (actual, expected) {
            (Ok(actual), Ok(expected)) => (actual, expected),
            (Err(e), _) | (_, Err(e)) => {
                warn!(subtest_id, test_id, "Diff checker couldn't read output: {}", e);
                return CheckerOutcome::failed();
            }
        };

        if compare_output(&String::from_utf8_lossy(&actual), &String::from_utf8_lossy(&expected)) {
            CheckerOutcome::new("Correct", Decimal::ONE_HUNDRED)
        } else {
            CheckerOutcome::new("Wrong answer", Decimal::ZERO)
        }
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Compare outputs ignoring trailing whitespace on each line and trailing blank lines
pub fn compare_output(actual: &str, expected: &str) -> bool {
    // Normalize outputs: trim trailing whitespace from each line
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        // Remove trailing empty lines
        while lines.last().map(|s| s.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}
