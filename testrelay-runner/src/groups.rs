// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grouping tests into units of work.
//!
//! A [`TestGroup`] is a list of tests that run in one worker, in order. Tests can only share a
//! group if they share a worker hash and a require file. Beyond that, tests are grouped by the
//! parallel mode of their suites:
//!
//! * Tests outside any parallel suite form one group per (worker hash, require file).
//! * Tests inside a parallel suite but outside any serial suite, with no `beforeAll`/`afterAll`
//!   hook in their ancestry, each get their own group.
//! * Tests inside a serial suite nested in a parallel suite form one group per outermost serial
//!   suite.
//! * Tests inside a parallel suite with `beforeAll`/`afterAll` hooks are split into at most
//!   `workers` groups of near-equal size, so the hooks run as few times as possible.

use crate::tree::{ParallelMode, SuiteIndex, TestCase, TestIndex, TestTree};
use camino::Utf8PathBuf;
use indexmap::IndexMap;

/// A list of tests that run in order in the same worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestGroup {
    /// The worker hash shared by every test in the group.
    pub worker_hash: String,

    /// The file every test in the group is declared in.
    pub require_file: Utf8PathBuf,

    /// The repeat-each index.
    pub repeat_each_index: usize,

    /// The project.
    pub project_id: String,

    /// The tests, in order.
    pub tests: Vec<TestIndex>,
}

impl TestGroup {
    /// Creates an empty group with the attributes of `test`.
    pub fn for_test(test: &TestCase) -> Self {
        Self {
            worker_hash: test.worker_hash.clone(),
            require_file: test.require_file.clone(),
            repeat_each_index: test.repeat_each_index,
            project_id: test.project_id.clone(),
            tests: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
enum ParallelKey {
    Serial(SuiteIndex),
    Test(TestIndex),
}

struct FileBuckets {
    general: TestGroup,
    parallel: IndexMap<ParallelKey, TestGroup>,
    parallel_with_hooks: TestGroup,
}

/// Groups the tests of `project_suites` for a run with `workers` worker slots.
///
/// Groups come out in the order their worker hashes and require files are first seen, so simple
/// runs keep the declaration order.
pub fn create_test_groups(
    tree: &TestTree,
    project_suites: &[SuiteIndex],
    workers: usize,
) -> Vec<TestGroup> {
    let mut by_hash: IndexMap<&str, IndexMap<&Utf8PathBuf, FileBuckets>> = IndexMap::new();

    for &project_suite in project_suites {
        for test_index in tree.all_tests(project_suite) {
            let test = tree.test(test_index);
            let buckets = by_hash
                .entry(&test.worker_hash)
                .or_default()
                .entry(&test.require_file)
                .or_insert_with(|| FileBuckets {
                    general: TestGroup::for_test(test),
                    parallel: IndexMap::new(),
                    parallel_with_hooks: TestGroup::for_test(test),
                });

            // A parallel suite cannot be nested inside a serial one, so the outermost serial
            // suite, if any, is inside the parallel region.
            let mut inside_parallel = false;
            let mut outermost_serial = None;
            let mut has_all_hooks = false;
            for ancestor in tree.ancestors(test.parent) {
                let suite = tree.suite(ancestor);
                match suite.parallel_mode {
                    ParallelMode::Serial => outermost_serial = Some(ancestor),
                    ParallelMode::Parallel => inside_parallel = true,
                    ParallelMode::None | ParallelMode::Default => {}
                }
                has_all_hooks |= suite.hooks.iter().any(|hook| hook.kind.is_all());
            }

            if !inside_parallel {
                buckets.general.tests.push(test_index);
            } else if has_all_hooks && outermost_serial.is_none() {
                buckets.parallel_with_hooks.tests.push(test_index);
            } else {
                let key = match outermost_serial {
                    Some(suite) => ParallelKey::Serial(suite),
                    None => ParallelKey::Test(test_index),
                };
                buckets
                    .parallel
                    .entry(key)
                    .or_insert_with(|| TestGroup::for_test(test))
                    .tests
                    .push(test_index);
            }
        }
    }

    let workers = workers.max(1);
    let mut result = Vec::new();
    for by_file in by_hash.into_values() {
        for buckets in by_file.into_values() {
            if !buckets.general.tests.is_empty() {
                result.push(buckets.general);
            }
            result.extend(buckets.parallel.into_values());

            let with_hooks = buckets.parallel_with_hooks;
            let group_size = with_hooks.tests.len().div_ceil(workers);
            for chunk in with_hooks.tests.chunks(group_size.max(1)) {
                result.push(TestGroup {
                    tests: chunk.to_vec(),
                    ..TestGroup::for_test(tree.test(chunk[0]))
                });
            }
        }
    }
    result
}
