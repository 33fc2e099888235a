// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::tree::{TestIndex, TestOutcome, TestTree};
use testrelay_metadata::TestStatus;

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of tests that were expected to be run at the beginning.
    pub initial_run_count: usize,

    /// The number of tests whose attempts all matched the expected status.
    pub expected: usize,

    /// The number of tests that never matched the expected status.
    pub unexpected: usize,

    /// The number of tests that matched the expected status only after a retry.
    pub flaky: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,

    /// The number of tests that never finished: they were interrupted, or the run stopped before
    /// they were scheduled.
    pub not_run: usize,

    /// True if a worker reported errors outside of any test, for example in teardown.
    pub worker_errors: bool,
}

impl RunStats {
    /// Computes statistics for `tests` from their results.
    pub(crate) fn from_tree(tree: &TestTree, tests: &[TestIndex], worker_errors: bool) -> Self {
        let mut stats = Self {
            initial_run_count: tests.len(),
            worker_errors,
            ..Self::default()
        };
        for &index in tests {
            let test = &tree[index];
            let finished = test
                .results
                .last()
                .is_some_and(|result| result.status != TestStatus::Interrupted);
            if !finished {
                stats.not_run += 1;
                continue;
            }
            match test.outcome() {
                TestOutcome::Expected => stats.expected += 1,
                TestOutcome::Unexpected => stats.unexpected += 1,
                TestOutcome::Flaky => stats.flaky += 1,
                TestOutcome::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    /// Returns true if this run is considered a success.
    ///
    /// A run fails if any test had an unexpected outcome, if any test did not finish, or if a
    /// worker reported an error.
    pub fn is_success(&self) -> bool {
        self.unexpected == 0 && self.not_run == 0 && !self.worker_errors
    }

    /// Returns the number of tests that finished.
    pub fn finished_count(&self) -> usize {
        self.expected + self.unexpected + self.flaky + self.skipped
    }
}
