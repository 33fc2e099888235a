// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The suite/test tree.
//!
//! A run is described by a tree of suites: a root, one suite per project, one per file, and any
//! number of nested `describe` suites. Tests hang off suites. The tree is stored as two arenas
//! addressed by [`SuiteIndex`] and [`TestIndex`], so that parent links are plain indexes.
//!
//! Tests accumulate [`TestResult`]s, one per attempt, as the scheduler runs them.

mod result;

pub use result::*;

use crate::{
    errors::DuplicateTestIdError,
    fixtures::{FixtureFnId, FixtureList, OptionOverrides},
};
use camino::Utf8PathBuf;
use std::{collections::HashMap, fmt, ops::Index, time::Duration};
use testrelay_metadata::{Annotation, Location, TestStatus};

/// Index of a suite in a [`TestTree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SuiteIndex(usize);

/// Index of a test in a [`TestTree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TestIndex(usize);

/// Identifies a test type: a named set of fixture declarations that tests are declared with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TestTypeId(usize);

/// Values used for tests that don't override them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TreeDefaults {
    /// The retry budget.
    pub retries: usize,

    /// The per-test timeout.
    pub timeout: Duration,
}

impl Default for TreeDefaults {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// The kind of a suite.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteKind {
    /// The root suite.
    Root,

    /// A project.
    Project,

    /// A test file.
    File,

    /// A `describe` block.
    Describe,
}

/// How tests under a suite may be distributed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParallelMode {
    /// Not specified.
    #[default]
    None,

    /// Run with the default mode inherited from the configuration.
    Default,

    /// Tests run in order in the same worker. A failure stops the rest of the suite, and the
    /// suite is retried as a whole.
    Serial,

    /// Tests may be distributed across workers.
    Parallel,
}

/// The kind of a suite-level hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookKind {
    /// Runs once before the tests of the suite in a worker.
    BeforeAll,

    /// Runs once after the tests of the suite in a worker.
    AfterAll,

    /// Runs before each test.
    BeforeEach,

    /// Runs after each test.
    AfterEach,
}

impl HookKind {
    /// Returns true for hooks that run once per suite rather than once per test.
    pub fn is_all(self) -> bool {
        matches!(self, Self::BeforeAll | Self::AfterAll)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforeAll => "beforeAll",
            Self::AfterAll => "afterAll",
            Self::BeforeEach => "beforeEach",
            Self::AfterEach => "afterEach",
        })
    }
}

/// A suite-level hook.
#[derive(Clone, Debug)]
pub struct Hook {
    /// The hook kind.
    pub kind: HookKind,

    /// The hook body, if it uses fixtures.
    pub function: Option<FixtureFnId>,

    /// Where the hook was declared.
    pub location: Location,
}

/// The kind of a static modifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModifierKind {
    /// Skip the tests.
    Skip,

    /// Skip the tests, marking them as needing a fix.
    Fixme,

    /// Expect the tests to fail.
    Fail,

    /// Triple the timeout.
    Slow,
}

impl fmt::Display for ModifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skip => "skip",
            Self::Fixme => "fixme",
            Self::Fail => "fail",
            Self::Slow => "slow",
        })
    }
}

/// A conditional modifier declared on a suite. The condition is evaluated by the worker.
#[derive(Clone, Debug)]
pub struct Modifier {
    /// The modifier kind.
    pub kind: ModifierKind,

    /// The condition, if it uses fixtures.
    pub function: Option<FixtureFnId>,

    /// Where the modifier was declared.
    pub location: Location,
}

/// Project data carried by project suites.
#[derive(Clone, Debug, Default)]
pub struct ProjectInfo {
    /// The project id.
    pub id: String,

    /// Option values that override option fixture defaults.
    pub option_overrides: Option<OptionOverrides>,

    /// Projects that must complete successfully before this one runs.
    pub dependencies: Vec<String>,
}

/// An entry in a suite, in declaration order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteEntry {
    /// A child suite.
    Suite(SuiteIndex),

    /// A test.
    Test(TestIndex),
}

/// A suite in the tree.
#[derive(Clone, Debug)]
pub struct Suite {
    /// The suite title. For file suites, the path of the file.
    pub title: String,

    /// The suite kind.
    pub kind: SuiteKind,

    /// The parent suite. `None` only for the root.
    pub parent: Option<SuiteIndex>,

    /// Children, in declaration order.
    pub entries: Vec<SuiteEntry>,

    /// Where the suite was declared.
    pub location: Option<Location>,

    /// The parallel mode.
    pub parallel_mode: ParallelMode,

    /// Hooks declared directly on this suite.
    pub hooks: Vec<Hook>,

    /// Modifiers declared directly on this suite.
    pub modifiers: Vec<Modifier>,

    /// Annotations declared directly on this suite.
    pub annotations: Vec<Annotation>,

    /// Timeout override for tests under this suite.
    pub timeout: Option<Duration>,

    /// Retry override for tests under this suite.
    pub retries: Option<usize>,

    /// Fixture overrides (`use`) declared on this suite.
    pub fixture_overrides: Vec<FixtureList>,

    /// Set for project suites.
    pub project: Option<ProjectInfo>,
}

/// Declaration of a new suite. See [`TestTree::add_suite`].
#[derive(Clone, Debug)]
pub struct SuiteDecl {
    /// The suite title.
    pub title: String,

    /// The suite kind. Must not be [`SuiteKind::Root`].
    pub kind: SuiteKind,

    /// Where the suite was declared.
    pub location: Option<Location>,

    /// The parallel mode.
    pub parallel_mode: ParallelMode,

    /// Hooks.
    pub hooks: Vec<Hook>,

    /// Modifiers.
    pub modifiers: Vec<Modifier>,

    /// Annotations.
    pub annotations: Vec<Annotation>,

    /// Timeout override.
    pub timeout: Option<Duration>,

    /// Retry override.
    pub retries: Option<usize>,

    /// Fixture overrides.
    pub fixture_overrides: Vec<FixtureList>,

    /// Project data, for project suites.
    pub project: Option<ProjectInfo>,
}

impl SuiteDecl {
    fn new(title: impl Into<String>, kind: SuiteKind) -> Self {
        Self {
            title: title.into(),
            kind,
            location: None,
            parallel_mode: ParallelMode::None,
            hooks: Vec::new(),
            modifiers: Vec::new(),
            annotations: Vec::new(),
            timeout: None,
            retries: None,
            fixture_overrides: Vec::new(),
            project: None,
        }
    }

    /// Declares a project suite.
    pub fn project(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut decl = Self::new(id.clone(), SuiteKind::Project);
        decl.project = Some(ProjectInfo {
            id,
            option_overrides: None,
            dependencies: Vec::new(),
        });
        decl
    }

    /// Sets the projects this project depends on. Only meaningful for project suites.
    pub fn with_dependencies(
        mut self,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        if let Some(project) = &mut self.project {
            project.dependencies = dependencies.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Declares a file suite.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(path, SuiteKind::File)
    }

    /// Declares a `describe` suite.
    pub fn describe(title: impl Into<String>) -> Self {
        Self::new(title, SuiteKind::Describe)
    }

    /// Sets the parallel mode.
    pub fn with_parallel_mode(mut self, parallel_mode: ParallelMode) -> Self {
        self.parallel_mode = parallel_mode;
        self
    }

    /// Adds a hook.
    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Sets the retry override.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Adds a fixture override list.
    pub fn with_fixture_overrides(mut self, list: FixtureList) -> Self {
        self.fixture_overrides.push(list);
        self
    }
}

/// A test in the tree.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// The stable test id.
    pub id: String,

    /// The test title.
    pub title: String,

    /// The suite the test belongs to.
    pub parent: SuiteIndex,

    /// Where the test was declared.
    pub location: Location,

    /// The expected status. Workers may change this at runtime.
    pub expected_status: TestStatus,

    /// The retry budget.
    pub retries: usize,

    /// The timeout.
    pub timeout: Duration,

    /// Annotations.
    pub annotations: Vec<Annotation>,

    /// The project the test belongs to.
    pub project_id: String,

    /// The file that declares the test.
    pub require_file: Utf8PathBuf,

    /// The repeat-each index.
    pub repeat_each_index: usize,

    /// The worker hash. Tests with different hashes require different workers. Assigned by
    /// [`PoolBuilder`](crate::fixtures::PoolBuilder).
    pub worker_hash: String,

    /// The test type the test was declared with.
    pub test_type: Option<TestTypeId>,

    /// The test body, if it uses fixtures.
    pub function: Option<FixtureFnId>,

    /// One result per attempt, in order.
    pub results: Vec<TestResult>,
}

/// The outcome of a test across all its attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestOutcome {
    /// Every attempt was skipped.
    Skipped,

    /// Every attempt matched the expected status.
    Expected,

    /// No attempt matched the expected status.
    Unexpected,

    /// Some attempts matched the expected status, and some did not.
    Flaky,
}

impl TestCase {
    /// Returns the outcome of this test, ignoring interrupted attempts.
    ///
    /// A skipped attempt counts as expected only if the test is expected to be skipped. Other
    /// skipped attempts did not run, and are ignored like interrupted ones.
    pub fn outcome(&self) -> TestOutcome {
        let mut expected_skips = 0;
        let mut expected = 0;
        let mut unexpected = 0;
        for result in &self.results {
            match result.status {
                TestStatus::Interrupted => {}
                TestStatus::Skipped if self.expected_status == TestStatus::Skipped => {
                    expected_skips += 1;
                }
                TestStatus::Skipped => {}
                status if status == self.expected_status => expected += 1,
                _ => unexpected += 1,
            }
        }

        if expected == 0 && unexpected == 0 {
            TestOutcome::Skipped
        } else if unexpected == 0 {
            TestOutcome::Expected
        } else if expected == 0 && expected_skips == 0 {
            TestOutcome::Unexpected
        } else {
            TestOutcome::Flaky
        }
    }

    /// Returns true if the outcome is not a failure.
    pub fn ok(&self) -> bool {
        matches!(
            self.outcome(),
            TestOutcome::Expected | TestOutcome::Flaky | TestOutcome::Skipped
        )
    }

    /// Appends a new result for the next attempt, returning its index.
    pub fn append_result(&mut self) -> usize {
        let retry = self.results.len();
        self.results.push(TestResult::new(retry));
        retry
    }
}

/// Declaration of a new test. See [`TestTree::add_test`].
#[derive(Clone, Debug)]
pub struct TestDecl {
    /// The stable test id. Must be unique within the tree.
    pub id: String,

    /// The title.
    pub title: String,

    /// Where the test was declared.
    pub location: Location,

    /// The expected status.
    pub expected_status: TestStatus,

    /// Retry override. Falls back to the nearest suite override, then the tree default.
    pub retries: Option<usize>,

    /// Timeout override. Falls back to the nearest suite override, then the tree default.
    pub timeout: Option<Duration>,

    /// Annotations.
    pub annotations: Vec<Annotation>,

    /// The repeat-each index.
    pub repeat_each_index: usize,

    /// The test type.
    pub test_type: Option<TestTypeId>,

    /// The test body, if it uses fixtures.
    pub function: Option<FixtureFnId>,
}

impl TestDecl {
    /// Creates a new declaration with default settings.
    pub fn new(id: impl Into<String>, title: impl Into<String>, location: Location) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            location,
            expected_status: TestStatus::Passed,
            retries: None,
            timeout: None,
            annotations: Vec::new(),
            repeat_each_index: 0,
            test_type: None,
            function: None,
        }
    }

    /// Sets the retry budget.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Sets the test type.
    pub fn with_test_type(mut self, test_type: TestTypeId) -> Self {
        self.test_type = Some(test_type);
        self
    }
}

/// A set of fixture declarations tests can be declared with.
#[derive(Clone, Debug, Default)]
pub struct TestType {
    /// Fixture lists, base first.
    pub fixtures: Vec<FixtureList>,
}

/// The suite/test tree for a run.
#[derive(Clone, Debug)]
pub struct TestTree {
    suites: Vec<Suite>,
    tests: Vec<TestCase>,
    test_types: Vec<TestType>,
    by_id: HashMap<String, TestIndex>,
    defaults: TreeDefaults,
}

impl TestTree {
    /// Creates an empty tree with just a root suite.
    pub fn new(defaults: TreeDefaults) -> Self {
        let root = Suite {
            title: String::new(),
            kind: SuiteKind::Root,
            parent: None,
            entries: Vec::new(),
            location: None,
            parallel_mode: ParallelMode::None,
            hooks: Vec::new(),
            modifiers: Vec::new(),
            annotations: Vec::new(),
            timeout: None,
            retries: None,
            fixture_overrides: Vec::new(),
            project: None,
        };
        Self {
            suites: vec![root],
            tests: Vec::new(),
            test_types: Vec::new(),
            by_id: HashMap::new(),
            defaults,
        }
    }

    /// Returns the root suite.
    pub fn root(&self) -> SuiteIndex {
        SuiteIndex(0)
    }

    /// Returns the defaults for this tree.
    pub fn defaults(&self) -> TreeDefaults {
        self.defaults
    }

    /// Registers a test type.
    pub fn add_test_type(&mut self, test_type: TestType) -> TestTypeId {
        self.test_types.push(test_type);
        TestTypeId(self.test_types.len() - 1)
    }

    /// Returns a test type.
    pub fn test_type(&self, id: TestTypeId) -> &TestType {
        &self.test_types[id.0]
    }

    /// Adds a suite under `parent`.
    pub fn add_suite(&mut self, parent: SuiteIndex, decl: SuiteDecl) -> SuiteIndex {
        let index = SuiteIndex(self.suites.len());
        self.suites.push(Suite {
            title: decl.title,
            kind: decl.kind,
            parent: Some(parent),
            entries: Vec::new(),
            location: decl.location,
            parallel_mode: decl.parallel_mode,
            hooks: decl.hooks,
            modifiers: decl.modifiers,
            annotations: decl.annotations,
            timeout: decl.timeout,
            retries: decl.retries,
            fixture_overrides: decl.fixture_overrides,
            project: decl.project,
        });
        self.suites[parent.0].entries.push(SuiteEntry::Suite(index));
        index
    }

    /// Adds a test under `parent`.
    ///
    /// The retry budget and timeout are resolved here. The project id and require file come from
    /// the nearest project and file suites.
    pub fn add_test(
        &mut self,
        parent: SuiteIndex,
        decl: TestDecl,
    ) -> Result<TestIndex, DuplicateTestIdError> {
        if self.by_id.contains_key(&decl.id) {
            return Err(DuplicateTestIdError::new(decl.id));
        }

        let mut retries = decl.retries;
        let mut timeout = decl.timeout;
        let mut project_id = None;
        let mut require_file = None;
        for ancestor in self.ancestors(parent) {
            let suite = &self.suites[ancestor.0];
            retries = retries.or(suite.retries);
            timeout = timeout.or(suite.timeout);
            if project_id.is_none() {
                project_id = suite.project.as_ref().map(|project| project.id.clone());
            }
            if require_file.is_none() && suite.kind == SuiteKind::File {
                require_file = Some(Utf8PathBuf::from(&suite.title));
            }
        }

        let index = TestIndex(self.tests.len());
        self.by_id.insert(decl.id.clone(), index);
        self.tests.push(TestCase {
            id: decl.id,
            title: decl.title,
            parent,
            require_file: require_file.unwrap_or_else(|| decl.location.file.clone()),
            location: decl.location,
            expected_status: decl.expected_status,
            retries: retries.unwrap_or(self.defaults.retries),
            timeout: timeout.unwrap_or(self.defaults.timeout),
            annotations: decl.annotations,
            project_id: project_id.unwrap_or_default(),
            repeat_each_index: decl.repeat_each_index,
            worker_hash: String::new(),
            test_type: decl.test_type,
            function: decl.function,
            results: Vec::new(),
        });
        self.suites[parent.0].entries.push(SuiteEntry::Test(index));
        Ok(index)
    }

    /// Returns a suite.
    pub fn suite(&self, index: SuiteIndex) -> &Suite {
        &self.suites[index.0]
    }

    /// Returns a test.
    pub fn test(&self, index: TestIndex) -> &TestCase {
        &self.tests[index.0]
    }

    /// Returns a test mutably.
    pub fn test_mut(&mut self, index: TestIndex) -> &mut TestCase {
        &mut self.tests[index.0]
    }

    /// Looks up a test by id.
    pub fn test_by_id(&self, id: &str) -> Option<TestIndex> {
        self.by_id.get(id).copied()
    }

    /// Returns the number of tests in the tree.
    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    /// Iterates over every test in insertion order.
    pub fn tests(&self) -> impl Iterator<Item = (TestIndex, &TestCase)> + '_ {
        self.tests
            .iter()
            .enumerate()
            .map(|(index, test)| (TestIndex(index), test))
    }

    /// Iterates over `suite` and its ancestors, innermost first.
    pub fn ancestors(&self, suite: SuiteIndex) -> impl Iterator<Item = SuiteIndex> + '_ {
        std::iter::successors(Some(suite), |index| self.suites[index.0].parent)
    }

    /// Returns every test under `suite`, in declaration order.
    pub fn all_tests(&self, suite: SuiteIndex) -> Vec<TestIndex> {
        let mut out = Vec::new();
        self.collect_tests(suite, &mut out);
        out
    }

    fn collect_tests(&self, suite: SuiteIndex, out: &mut Vec<TestIndex>) {
        for entry in &self.suites[suite.0].entries {
            match *entry {
                SuiteEntry::Suite(child) => self.collect_tests(child, out),
                SuiteEntry::Test(test) => out.push(test),
            }
        }
    }

    /// Returns the project suites, in declaration order.
    pub fn project_suites(&self) -> Vec<SuiteIndex> {
        self.suites[0]
            .entries
            .iter()
            .filter_map(|entry| match *entry {
                SuiteEntry::Suite(index) if self.suites[index.0].kind == SuiteKind::Project => {
                    Some(index)
                }
                _ => None,
            })
            .collect()
    }

    /// Looks up a project suite by project id.
    pub fn project_suite(&self, project_id: &str) -> Option<SuiteIndex> {
        self.project_suites().into_iter().find(|index| {
            self.suites[index.0]
                .project
                .as_ref()
                .is_some_and(|project| project.id == project_id)
        })
    }

    /// Returns the titles from the outermost `describe` (or file) down to the test.
    pub fn title_path(&self, test: TestIndex) -> Vec<&str> {
        let test = &self.tests[test.0];
        let mut path: Vec<&str> = self
            .ancestors(test.parent)
            .map(|index| &self.suites[index.0])
            .filter(|suite| matches!(suite.kind, SuiteKind::File | SuiteKind::Describe))
            .map(|suite| suite.title.as_str())
            .collect();
        path.reverse();
        path.push(&test.title);
        path
    }
}

impl Index<SuiteIndex> for TestTree {
    type Output = Suite;

    fn index(&self, index: SuiteIndex) -> &Suite {
        self.suite(index)
    }
}

impl Index<TestIndex> for TestTree {
    type Output = TestCase;

    fn index(&self, index: TestIndex) -> &TestCase {
        self.test(index)
    }
}
