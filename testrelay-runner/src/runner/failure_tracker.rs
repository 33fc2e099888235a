// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::MaxFail,
    tree::{TestCase, TestOutcome},
};

/// Counts failures across a run and decides when the max-failures threshold is reached.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    max_failures: MaxFail,
    failure_count: usize,
    has_worker_errors: bool,
}

impl FailureTracker {
    pub(crate) fn new(max_failures: MaxFail) -> Self {
        Self {
            max_failures,
            failure_count: 0,
            has_worker_errors: false,
        }
    }

    /// Records the end of an attempt. `test` must already carry the attempt's result.
    ///
    /// A test counts as a failure once its outcome is unexpected and it has no retries left.
    pub(crate) fn on_test_end(&mut self, test: &TestCase) {
        if test.outcome() == TestOutcome::Unexpected && test.results.len() > test.retries {
            self.failure_count += 1;
        }
    }

    pub(crate) fn on_worker_error(&mut self) {
        self.has_worker_errors = true;
    }

    pub(crate) fn has_worker_errors(&self) -> bool {
        self.has_worker_errors
    }

    pub(crate) fn has_reached_max_failures(&self) -> bool {
        self.max_failures.is_exceeded(self.failure_count)
    }

    /// The message reported once when the threshold is first reached.
    pub(crate) fn stopped_early_message(&self) -> String {
        let max = match self.max_failures {
            MaxFail::Count(n) => n,
            MaxFail::All => self.failure_count,
        };
        format!("Testing stopped early after {max} maximum allowed failures.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{SuiteDecl, TestDecl, TestTree, TreeDefaults};
    use testrelay_metadata::{Location, TestStatus};

    fn failing_test(retries: usize) -> (TestTree, crate::tree::TestIndex) {
        let mut tree = TestTree::new(TreeDefaults::default());
        let project = tree.add_suite(tree.root(), SuiteDecl::project("p"));
        let file = tree.add_suite(project, SuiteDecl::file("a.spec.ts"));
        let test = tree
            .add_test(
                file,
                TestDecl::new("t", "t", Location::new("a.spec.ts", 1, 1)).with_retries(retries),
            )
            .unwrap();
        (tree, test)
    }

    #[test]
    fn counts_only_exhausted_failures() {
        let (mut tree, test) = failing_test(1);
        let mut tracker = FailureTracker::new(MaxFail::Count(1));

        let case = tree.test_mut(test);
        let retry = case.append_result();
        case.results[retry].status = TestStatus::Failed;
        tracker.on_test_end(case);
        assert!(
            !tracker.has_reached_max_failures(),
            "a failure with retries left does not count"
        );

        let retry = case.append_result();
        case.results[retry].status = TestStatus::Failed;
        tracker.on_test_end(case);
        assert!(tracker.has_reached_max_failures());
        assert_eq!(
            tracker.stopped_early_message(),
            "Testing stopped early after 1 maximum allowed failures."
        );
    }

    #[test]
    fn flaky_is_not_a_failure() {
        let (mut tree, test) = failing_test(1);
        let mut tracker = FailureTracker::new(MaxFail::Count(1));
        let case = tree.test_mut(test);
        let retry = case.append_result();
        case.results[retry].status = TestStatus::Failed;
        let retry = case.append_result();
        case.results[retry].status = TestStatus::Passed;
        tracker.on_test_end(case);
        assert!(!tracker.has_reached_max_failures());
        assert!(!tracker.has_worker_errors());
    }
}
