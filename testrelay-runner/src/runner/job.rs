// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracking a single group while it runs in a worker.

use super::RunContext;
use crate::{
    groups::TestGroup,
    reporter::{TestAttempt, TestEventKind},
    tree::{
        Attachment, OutputChunk, ParallelMode, SuiteIndex, TestIndex, TestStep, TestTree,
        wall_time,
    },
};
use indexmap::{IndexMap, IndexSet};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use testrelay_metadata::{
    TestError, TestStatus,
    protocol::{
        AttachmentParams, DoneParams, RunEntry, RunGroupParams, StepBeginParams, StepEndParams,
        TestBeginParams, TestEndParams, WorkerEvent,
    },
};
use tracing::debug;

/// What happened to a group once its job is over.
#[derive(Debug, Default)]
pub(crate) struct JobResult {
    /// Tests left over from the group, plus retries. Goes to the front of the queue.
    pub(crate) new_job: Option<TestGroup>,

    /// True if anything went wrong. The worker that ran the job is not reused.
    pub(crate) did_fail: bool,
}

/// A test that began and has not ended.
#[derive(Debug)]
struct RunningTest {
    test: TestIndex,
    result: usize,
    /// Step ids to indexes into the result's steps, for steps that have not ended.
    steps: HashMap<String, usize>,
}

/// Interprets worker events for one group.
#[derive(Debug)]
pub(crate) struct JobController {
    group: TestGroup,
    remaining: IndexMap<String, TestIndex>,
    running: HashMap<String, RunningTest>,
    currently_running: Option<(TestIndex, usize)>,
    failed: IndexSet<TestIndex>,
    nonretriable_tests: HashSet<TestIndex>,
    nonretriable_suites: HashSet<SuiteIndex>,
    worker_index: usize,
    parallel_index: usize,
}

impl JobController {
    pub(crate) fn new(group: TestGroup, tree: &TestTree) -> Self {
        let remaining = group
            .tests
            .iter()
            .map(|&test| (tree[test].id.clone(), test))
            .collect();
        Self {
            group,
            remaining,
            running: HashMap::new(),
            currently_running: None,
            failed: IndexSet::new(),
            nonretriable_tests: HashSet::new(),
            nonretriable_suites: HashSet::new(),
            worker_index: 0,
            parallel_index: 0,
        }
    }

    pub(crate) fn group(&self) -> &TestGroup {
        &self.group
    }

    /// The test and result index of the test the worker is running, if any.
    pub(crate) fn currently_running(&self) -> Option<(TestIndex, usize)> {
        self.currently_running
    }

    /// Reports every test in the group as skipped if none of them is expected to run.
    ///
    /// Returns true if the group was handled this way and needs no worker.
    pub(crate) fn skip_whole_job(&mut self, run: &mut RunContext<'_>) -> bool {
        let all_skipped = self
            .group
            .tests
            .iter()
            .all(|&test| run.tree[test].expected_status == TestStatus::Skipped);
        if !all_skipped || run.failure_tracker.has_reached_max_failures() {
            return false;
        }

        debug!(
            tests = self.group.tests.len(),
            file = %self.group.require_file,
            "every test in group is skipped, not starting a worker"
        );
        for test in self.group.tests.clone() {
            let result = self.begin_synthesized(run, test);
            let data = &mut run.tree.test_mut(test).results[result];
            data.status = TestStatus::Skipped;
            data.duration = Some(Duration::ZERO);
            self.report_test_end(run, test, result);
        }
        self.remaining.clear();
        true
    }

    /// Binds the job to a worker and returns the group to send it.
    pub(crate) fn start(
        &mut self,
        tree: &TestTree,
        worker_index: usize,
        parallel_index: usize,
    ) -> RunGroupParams {
        self.worker_index = worker_index;
        self.parallel_index = parallel_index;
        RunGroupParams {
            require_file: self.group.require_file.clone(),
            entries: self
                .group
                .tests
                .iter()
                .map(|&test| RunEntry {
                    test_id: tree[test].id.clone(),
                    retry: tree[test].results.len(),
                })
                .collect(),
        }
    }

    /// Handles a protocol event. Returns the job result once the worker reports that the group
    /// is done.
    pub(crate) fn on_event(
        &mut self,
        run: &mut RunContext<'_>,
        event: WorkerEvent,
    ) -> Option<JobResult> {
        match event {
            WorkerEvent::TestBegin(params) => self.on_test_begin(run, params),
            WorkerEvent::TestEnd(params) => self.on_test_end(run, params),
            WorkerEvent::StepBegin(params) => self.on_step_begin(run, params),
            WorkerEvent::StepEnd(params) => self.on_step_end(run, params),
            WorkerEvent::Attach(params) => self.on_attach(run, params),
            WorkerEvent::Done(params) => return Some(self.on_done(run, params, None)),
            WorkerEvent::EnvProduced(_)
            | WorkerEvent::Stdout(_)
            | WorkerEvent::Stderr(_)
            | WorkerEvent::TeardownErrors(_) => {
                debug!("worker-level event routed to job, ignoring");
            }
        }
        None
    }

    /// Finishes the job because the worker went away, or never came up.
    ///
    /// `unexpected_exit` is `None` if the worker was asked to stop.
    pub(crate) fn on_exit(
        &mut self,
        run: &mut RunContext<'_>,
        unexpected_exit: Option<TestError>,
    ) -> JobResult {
        if unexpected_exit.is_none() {
            self.interrupt_running(run);
        }
        self.on_done(run, DoneParams::default(), unexpected_exit)
    }

    /// Ends tests that a stopped worker left running. They are not retried.
    fn interrupt_running(&mut self, run: &mut RunContext<'_>) {
        let running: Vec<(String, RunningTest)> = self.running.drain().collect();
        for (id, running) in running {
            self.remaining.shift_remove(&id);
            let data = &mut run.tree.test_mut(running.test).results[running.result];
            data.status = TestStatus::Interrupted;
            if data.duration.is_none() {
                data.duration = Some(Duration::ZERO);
            }
            self.report_test_end(run, running.test, running.result);
        }
        self.currently_running = None;
    }

    fn on_test_begin(&mut self, run: &mut RunContext<'_>, params: TestBeginParams) {
        let Some(&test) = self.remaining.get(&params.test_id) else {
            debug!(test_id = %params.test_id, "test-begin for a test not in this group");
            return;
        };

        let case = run.tree.test_mut(test);
        let result = case.append_result();
        let data = &mut case.results[result];
        data.worker_index = Some(self.worker_index);
        data.parallel_index = Some(self.parallel_index);
        data.start_time = wall_time(params.start_wall_time);

        self.running.insert(
            params.test_id,
            RunningTest {
                test,
                result,
                steps: HashMap::new(),
            },
        );
        self.currently_running = Some((test, result));
        let attempt = attempt(run.tree, test, result);
        run.emitter.emit(TestEventKind::TestStarted {
            attempt,
            worker_index: self.worker_index,
            parallel_index: self.parallel_index,
        });
    }

    fn on_test_end(&mut self, run: &mut RunContext<'_>, mut params: TestEndParams) {
        if run.failure_tracker.has_reached_max_failures() {
            // One failure reason is enough: later tests are reported as interrupted.
            params.status = TestStatus::Interrupted;
            params.errors.clear();
        }
        let Some(running) = self.running.remove(&params.test_id) else {
            debug!(test_id = %params.test_id, "test-end for a test that did not begin");
            return;
        };
        self.remaining.shift_remove(&params.test_id);

        let test = running.test;
        let case = run.tree.test_mut(test);
        let data = &mut case.results[running.result];
        data.duration = Some(Duration::from_millis(params.duration_ms));
        data.errors = params.errors;
        data.status = params.status;
        data.annotations = params.annotations.clone();
        // The last attempt's annotations win.
        case.annotations = params.annotations;
        case.expected_status = params.expected_status;
        case.timeout = Duration::from_millis(params.timeout_ms);

        if params.status != TestStatus::Skipped && params.status != params.expected_status {
            self.failed.insert(test);
        }
        if params.has_nonretriable_error {
            self.add_nonretriable(run.tree, test);
        }
        self.report_test_end(run, test, running.result);
        self.currently_running = None;
    }

    fn add_nonretriable(&mut self, tree: &TestTree, test: TestIndex) {
        self.nonretriable_tests.insert(test);
        for suite in tree.ancestors(tree[test].parent) {
            if tree.suite(suite).parallel_mode == ParallelMode::Serial {
                self.nonretriable_suites.insert(suite);
            }
        }
    }

    fn on_step_begin(&mut self, run: &mut RunContext<'_>, params: StepBeginParams) {
        let Some(running) = self.running.get_mut(&params.test_id) else {
            // The test has ended, but steps are still coming.
            debug!(test_id = %params.test_id, "ignoring step-begin for a finished test");
            return;
        };
        let (test, result_index) = (running.test, running.result);
        let parent = params
            .parent_step_id
            .as_ref()
            .and_then(|id| running.steps.get(id).copied());

        let result = &mut run.tree.test_mut(test).results[result_index];
        let step = result.steps.len();
        result.steps.push(TestStep {
            title: params.title.clone(),
            category: params.category.clone(),
            parent,
            children: Vec::new(),
            start_time: wall_time(params.wall_time),
            duration: None,
            error: None,
            attachments: Vec::new(),
            annotations: Vec::new(),
            location: params.location,
        });
        if let Some(parent) = parent {
            result.steps[parent].children.push(step);
        }
        running.steps.insert(params.step_id, step);

        let attempt = attempt(run.tree, test, result_index);
        run.emitter.emit(TestEventKind::StepStarted {
            attempt,
            step,
            title: params.title,
            category: params.category,
        });
    }

    fn on_step_end(&mut self, run: &mut RunContext<'_>, params: StepEndParams) {
        let Some(running) = self.running.get_mut(&params.test_id) else {
            debug!(test_id = %params.test_id, "ignoring step-end for a finished test");
            return;
        };
        let (test, result) = (running.test, running.result);
        let Some(step) = running.steps.remove(&params.step_id) else {
            let attempt = attempt(run.tree, test, result);
            run.emitter.emit(TestEventKind::Stderr {
                attempt: Some(attempt),
                chunk: OutputChunk::Text(format!(
                    "Internal error: step end without step begin: {}",
                    params.step_id
                )),
            });
            return;
        };

        let data = &mut run.tree.test_mut(test).results[result].steps[step];
        let elapsed = params
            .wall_time
            .saturating_sub(data.start_time.timestamp_millis());
        let duration = Duration::from_millis(elapsed.max(0) as u64);
        data.duration = Some(duration);
        data.error = params.error.clone();
        data.annotations = params.annotations;
        let title = data.title.clone();

        let attempt = attempt(run.tree, test, result);
        run.emitter.emit(TestEventKind::StepFinished {
            attempt,
            step,
            title,
            duration,
            error: params.error,
        });
    }

    fn on_attach(&mut self, run: &mut RunContext<'_>, params: AttachmentParams) {
        let Some(running) = self.running.get(&params.test_id) else {
            debug!(test_id = %params.test_id, "ignoring attachment for a finished test");
            return;
        };
        let step = params
            .step_id
            .as_ref()
            .map(|id| (id, running.steps.get(id).copied()));

        let data = &mut run.tree.test_mut(running.test).results[running.result];
        let index = data.attachments.len();
        data.attachments.push(Attachment {
            name: params.name,
            content_type: params.content_type,
            path: params.path,
            body: params.body,
        });
        match step {
            Some((_, Some(step))) => data.steps[step].attachments.push(index),
            Some((id, None)) => run.emitter.emit(TestEventKind::Stderr {
                attempt: None,
                chunk: OutputChunk::Text(format!("Internal error: step id not found: {id}")),
            }),
            None => {}
        }
    }

    fn on_done(
        &mut self,
        run: &mut RunContext<'_>,
        params: DoneParams,
        unexpected_exit: Option<TestError>,
    ) -> JobResult {
        if self.remaining.is_empty()
            && self.failed.is_empty()
            && params.fatal_errors.is_empty()
            && params.skip_tests_due_to_setup_failure.is_empty()
            && params.fatal_unknown_test_ids.is_empty()
            && unexpected_exit.is_none()
        {
            return JobResult {
                new_job: None,
                did_fail: false,
            };
        }

        for test_id in &params.fatal_unknown_test_ids {
            if let Some(test) = self.remaining.shift_remove(test_id) {
                self.fail_test_with_errors(
                    run,
                    test,
                    vec![TestError::new(
                        "Test not found in the worker process. Make sure test title does not change.",
                    )],
                );
            }
        }

        if !params.fatal_errors.is_empty() {
            // The first remaining test carries the errors, the rest are skipped.
            let all: HashSet<String> = self.remaining.keys().cloned().collect();
            self.mass_skip(run, &all, params.fatal_errors, ErrorSpread::First);
        }

        let setup_failures: HashSet<String> = params.skip_tests_due_to_setup_failure.into_iter().collect();
        self.mass_skip(run, &setup_failures, Vec::new(), ErrorSpread::First);

        if let Some(error) = unexpected_exit {
            match self.currently_running {
                // A worker that exits during a test is blamed on that test.
                Some((test, _)) => {
                    let ids = HashSet::from([run.tree[test].id.clone()]);
                    self.mass_skip(run, &ids, vec![error], ErrorSpread::First);
                }
                // Otherwise the worker most likely could not load the file, and every
                // remaining test would hit the same problem.
                None => {
                    let all: HashSet<String> = self.remaining.keys().cloned().collect();
                    self.mass_skip(run, &all, vec![error], ErrorSpread::All);
                }
            }
        }

        self.finish_with_retries(run)
    }

    /// Computes the leftover job: remaining tests plus failed tests with retries left.
    fn finish_with_retries(&mut self, run: &mut RunContext<'_>) -> JobResult {
        let mut retry_candidates = IndexSet::new();
        let mut serial_suites_with_failures = IndexSet::new();
        for &test in &self.failed {
            let outermost_serial = run
                .tree
                .ancestors(run.tree[test].parent)
                .filter(|&suite| run.tree.suite(suite).parallel_mode == ParallelMode::Serial)
                .last();
            if let Some(suite) = outermost_serial {
                serial_suites_with_failures.insert(suite);
            }
            if !self.nonretriable_tests.contains(&test) {
                retry_candidates.insert(test);
            }
        }

        // A serial suite with a failure does not run any further in this job.
        let in_failed_serial: HashSet<String> = self
            .remaining
            .iter()
            .filter(|&(_, &test)| {
                run.tree
                    .ancestors(run.tree[test].parent)
                    .any(|suite| serial_suites_with_failures.contains(&suite))
            })
            .map(|(id, _)| id.clone())
            .collect();
        self.mass_skip(run, &in_failed_serial, Vec::new(), ErrorSpread::First);

        // Serial suites retry as a whole, unless a test in them failed in a way retrying can't
        // fix.
        for &suite in &serial_suites_with_failures {
            if self.nonretriable_suites.contains(&suite) {
                debug!(suite = %run.tree.suite(suite).title, "serial suite is not retriable");
                continue;
            }
            retry_candidates.extend(run.tree.all_tests(suite));
        }

        let mut next: IndexSet<TestIndex> = self.remaining.values().copied().collect();
        for test in retry_candidates {
            let case = &run.tree[test];
            if case.results.len() < case.retries + 1 {
                next.insert(test);
            }
        }

        // Keep the group's declaration order so serial suites rerun in order.
        let mut tests: Vec<TestIndex> = self
            .group
            .tests
            .iter()
            .copied()
            .filter(|test| next.contains(test))
            .collect();
        tests.extend(next.iter().copied().filter(|test| !self.group.tests.contains(test)));

        let new_job = (!tests.is_empty()).then(|| {
            debug!(
                tests = tests.len(),
                file = %self.group.require_file,
                "requeueing leftover tests"
            );
            TestGroup {
                tests,
                ..self.group.clone()
            }
        });
        JobResult {
            new_job,
            did_fail: true,
        }
    }

    fn mass_skip(
        &mut self,
        run: &mut RunContext<'_>,
        test_ids: &HashSet<String>,
        mut errors: Vec<TestError>,
        spread: ErrorSpread,
    ) {
        let matching: Vec<(String, TestIndex)> = self
            .remaining
            .iter()
            .filter(|(id, _)| test_ids.contains(*id))
            .map(|(id, &test)| (id.clone(), test))
            .collect();

        let mut reported = false;
        for (id, test) in matching {
            if !run.failure_tracker.has_reached_max_failures() {
                self.fail_test_with_errors(run, test, errors.clone());
                reported |= !errors.is_empty();
                if spread == ErrorSpread::First {
                    errors.clear();
                }
            }
            self.remaining.shift_remove(&id);
        }

        if !reported && !errors.is_empty() {
            // Errors after every test has finished, most likely in teardown.
            run.failure_tracker.on_worker_error();
            for error in errors {
                run.emitter.emit(TestEventKind::Error { error });
            }
        }
    }

    fn fail_test_with_errors(
        &mut self,
        run: &mut RunContext<'_>,
        test: TestIndex,
        errors: Vec<TestError>,
    ) {
        let id = run.tree[test].id.clone();
        // At most one test can have begun without ending.
        let result = match self.running.remove(&id) {
            Some(running) => running.result,
            None => self.begin_synthesized(run, test),
        };
        if self.currently_running.is_some_and(|(current, _)| current == test) {
            self.currently_running = None;
        }

        let data = &mut run.tree.test_mut(test).results[result];
        data.status = if errors.is_empty() {
            TestStatus::Skipped
        } else {
            TestStatus::Failed
        };
        data.errors = errors;
        if data.duration.is_none() {
            data.duration = Some(Duration::ZERO);
        }
        self.report_test_end(run, test, result);
        self.failed.insert(test);
    }

    /// Creates a result for a test the worker never began, reporting it as started.
    fn begin_synthesized(&mut self, run: &mut RunContext<'_>, test: TestIndex) -> usize {
        let case = run.tree.test_mut(test);
        let result = case.append_result();
        let data = &mut case.results[result];
        data.worker_index = Some(self.worker_index);
        data.parallel_index = Some(self.parallel_index);
        run.emitter.emit(TestEventKind::TestStarted {
            attempt: attempt(run.tree, test, result),
            worker_index: self.worker_index,
            parallel_index: self.parallel_index,
        });
        result
    }

    fn report_test_end(&mut self, run: &mut RunContext<'_>, test: TestIndex, result: usize) {
        let case = &run.tree[test];
        let data = &case.results[result];
        let kind = TestEventKind::TestFinished {
            attempt: attempt(run.tree, test, result),
            status: data.status,
            expected_status: case.expected_status,
            duration: data.duration.unwrap_or_default(),
            errors: data.errors.clone(),
            annotations: data.annotations.clone(),
        };
        run.emitter.emit(kind);

        let had_reached = run.failure_tracker.has_reached_max_failures();
        run.failure_tracker.on_test_end(&run.tree[test]);
        if !had_reached && run.failure_tracker.has_reached_max_failures() {
            let message = run.failure_tracker.stopped_early_message();
            run.emitter.emit(TestEventKind::Error {
                error: TestError::new(message),
            });
        }
    }
}

fn attempt(tree: &TestTree, test: TestIndex, result: usize) -> TestAttempt {
    TestAttempt {
        test,
        test_id: tree[test].id.clone(),
        retry: result,
    }
}

/// How errors are distributed over mass-skipped tests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ErrorSpread {
    /// The first test fails with the errors, the rest are skipped.
    First,

    /// Every test fails with the errors.
    All,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MaxFail,
        reporter::{EventEmitter, TestEvent},
        runner::FailureTracker,
        time::stopwatch,
        tree::{SuiteDecl, TestDecl, TreeDefaults},
    };
    use pretty_assertions::assert_eq;
    use testrelay_metadata::Location;

    struct Fixture {
        tree: TestTree,
        file: SuiteIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let mut tree = TestTree::new(TreeDefaults::default());
            let project = tree.add_suite(tree.root(), SuiteDecl::project("p"));
            let file = tree.add_suite(project, SuiteDecl::file("a.spec.ts"));
            Self { tree, file }
        }

        fn add(&mut self, parent: SuiteIndex, id: &str, retries: usize) -> TestIndex {
            self.tree
                .add_test(
                    parent,
                    TestDecl::new(id, id, Location::new("a.spec.ts", 1, 1)).with_retries(retries),
                )
                .unwrap()
        }

        fn group(&self, tests: &[TestIndex]) -> TestGroup {
            let mut group = TestGroup::for_test(&self.tree[tests[0]]);
            group.tests = tests.to_vec();
            group
        }
    }

    /// Runs `f` against a run context, returning what it returned and the events emitted.
    fn with_run<T>(
        tree: &mut TestTree,
        max_failures: MaxFail,
        f: impl FnOnce(&mut RunContext<'_>) -> T,
    ) -> (T, Vec<TestEvent>) {
        let mut events = Vec::new();
        let mut callback = |event: TestEvent| events.push(event);
        let mut run = RunContext {
            tree,
            failure_tracker: FailureTracker::new(max_failures),
            emitter: EventEmitter::new(&mut callback, stopwatch()),
            next_worker_index: 0,
        };
        let out = f(&mut run);
        drop(run);
        (out, events)
    }

    fn begin(id: &str) -> WorkerEvent {
        WorkerEvent::TestBegin(TestBeginParams {
            test_id: id.to_owned(),
            start_wall_time: 0,
        })
    }

    fn end(id: &str, status: TestStatus, nonretriable: bool) -> WorkerEvent {
        WorkerEvent::TestEnd(TestEndParams {
            test_id: id.to_owned(),
            duration_ms: 5,
            status,
            errors: match status {
                TestStatus::Failed => vec![TestError::new("boom")],
                _ => Vec::new(),
            },
            expected_status: TestStatus::Passed,
            annotations: Vec::new(),
            timeout_ms: 30_000,
            has_nonretriable_error: nonretriable,
        })
    }

    fn done() -> WorkerEvent {
        WorkerEvent::Done(DoneParams::default())
    }

    /// Checks that every finished attempt was reported as started first.
    fn assert_begins_before_ends(events: &[TestEvent]) {
        let mut started = HashSet::new();
        for event in events {
            match &event.kind {
                TestEventKind::TestStarted { attempt, .. } => {
                    assert!(started.insert((attempt.test, attempt.retry)), "started twice");
                }
                TestEventKind::TestFinished { attempt, .. } => {
                    assert!(
                        started.remove(&(attempt.test, attempt.retry)),
                        "{} finished without starting",
                        attempt.test_id
                    );
                }
                _ => {}
            }
        }
        assert!(started.is_empty(), "attempts started without finishing");
    }

    fn statuses(tree: &TestTree, test: TestIndex) -> Vec<TestStatus> {
        tree[test].results.iter().map(|result| result.status).collect()
    }

    #[test]
    fn clean_run_does_not_fail() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let group = f.group(&[a]);

        let (result, events) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            assert!(job.on_event(run, begin("a")).is_none());
            assert_eq!(job.currently_running().map(|(test, _)| test), Some(a));
            assert!(job.on_event(run, end("a", TestStatus::Passed, false)).is_none());
            assert_eq!(job.currently_running(), None);
            job.on_event(run, done()).unwrap()
        });
        assert!(!result.did_fail);
        assert!(result.new_job.is_none());
        assert_eq!(events.len(), 2);
        assert_eq!(f.tree[a].results[0].worker_index, Some(1));
    }

    #[test]
    fn failed_test_with_retries_is_requeued() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 1);
        let b = f.add(f.file, "b", 0);
        let group = f.group(&[a, b]);

        let (result, _) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("a"));
            job.on_event(run, end("a", TestStatus::Failed, false));
            job.on_event(run, done()).unwrap()
        });
        assert!(result.did_fail);
        // `b` never started, so it stays; `a` has a retry left.
        assert_eq!(result.new_job.unwrap().tests, vec![a, b]);
    }

    #[test]
    fn unexpected_exit_blames_running_test() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let b = f.add(f.file, "b", 0);
        let group = f.group(&[a, b]);

        let (result, _) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("a"));
            job.on_exit(run, Some(TestError::new("exited")))
        });
        assert_eq!(statuses(&f.tree, a), vec![TestStatus::Failed]);
        assert_eq!(f.tree[a].results[0].errors, vec![TestError::new("exited")]);
        assert_eq!(result.new_job.unwrap().tests, vec![b]);
    }

    #[test]
    fn stopped_worker_interrupts_running_test() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 2);
        let b = f.add(f.file, "b", 0);
        let group = f.group(&[a, b]);

        let (result, events) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("a"));
            job.on_exit(run, None)
        });
        assert_eq!(statuses(&f.tree, a), vec![TestStatus::Interrupted]);
        assert!(
            matches!(
                &events.last().unwrap().kind,
                TestEventKind::TestFinished { status: TestStatus::Interrupted, .. }
            ),
            "interrupted attempt is reported"
        );
        // `a` is not retried; `b` never started.
        assert_eq!(result.new_job.unwrap().tests, vec![b]);
    }

    #[test]
    fn unexpected_exit_between_tests_fails_everything() {
        let mut f = Fixture::new();
        let tests: Vec<_> = (0..5).map(|i| f.add(f.file, &format!("t{i}"), 0)).collect();
        let group = f.group(&tests);

        let (result, events) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_exit(run, Some(TestError::new("exited")))
        });
        for &test in &tests {
            assert_eq!(statuses(&f.tree, test), vec![TestStatus::Failed]);
            assert_eq!(f.tree[test].results[0].errors, vec![TestError::new("exited")]);
        }
        assert!(result.new_job.is_none());
        assert_eq!(events.len(), 10);
        assert_begins_before_ends(&events);
    }

    #[test]
    fn fatal_errors_fail_first_and_skip_rest() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let b = f.add(f.file, "b", 0);
        let group = f.group(&[a, b]);

        let (result, _) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(
                run,
                WorkerEvent::Done(DoneParams {
                    fatal_errors: vec![TestError::new("syntax error")],
                    ..DoneParams::default()
                }),
            )
            .unwrap()
        });
        assert_eq!(statuses(&f.tree, a), vec![TestStatus::Failed]);
        assert_eq!(statuses(&f.tree, b), vec![TestStatus::Skipped]);
        assert!(result.did_fail);
        assert!(result.new_job.is_none());
    }

    #[test]
    fn unknown_test_ids_fail() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let group = f.group(&[a]);

        with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(
                run,
                WorkerEvent::Done(DoneParams {
                    fatal_unknown_test_ids: vec!["a".to_owned()],
                    ..DoneParams::default()
                }),
            )
        });
        let errors = &f.tree[a].results[0].errors;
        assert!(errors[0].message.starts_with("Test not found in the worker process"));
    }

    #[test]
    fn serial_suite_retries_together() {
        let mut f = Fixture::new();
        let serial = f.tree.add_suite(
            f.file,
            SuiteDecl::describe("serial").with_parallel_mode(ParallelMode::Serial),
        );
        let tests: Vec<_> = (0..3).map(|i| f.add(serial, &format!("s{i}"), 1)).collect();
        let group = f.group(&tests);

        let (result, _) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("s0"));
            job.on_event(run, end("s0", TestStatus::Passed, false));
            job.on_event(run, begin("s1"));
            job.on_event(run, end("s1", TestStatus::Failed, false));
            job.on_event(run, done()).unwrap()
        });
        // s2 is skipped in this attempt, and the whole suite runs again in order.
        assert_eq!(statuses(&f.tree, tests[2]), vec![TestStatus::Skipped]);
        assert_eq!(result.new_job.unwrap().tests, tests);
    }

    #[test]
    fn nonretriable_serial_suite_is_not_rescheduled() {
        let mut f = Fixture::new();
        let serial = f.tree.add_suite(
            f.file,
            SuiteDecl::describe("serial").with_parallel_mode(ParallelMode::Serial),
        );
        let tests: Vec<_> = (0..3).map(|i| f.add(serial, &format!("s{i}"), 2)).collect();
        let group = f.group(&tests);

        let (result, _) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("s0"));
            job.on_event(run, end("s0", TestStatus::Passed, false));
            job.on_event(run, begin("s1"));
            job.on_event(run, end("s1", TestStatus::Failed, true));
            job.on_event(run, done()).unwrap()
        });
        assert!(result.did_fail);
        assert!(result.new_job.is_none());
        assert_eq!(statuses(&f.tree, tests[1]), vec![TestStatus::Failed]);
        assert_eq!(statuses(&f.tree, tests[2]), vec![TestStatus::Skipped]);
    }

    #[test]
    fn max_failures_interrupts_later_tests() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let b = f.add(f.file, "b", 0);
        let group = f.group(&[a, b]);

        let (_, events) = with_run(&mut f.tree, MaxFail::Count(1), |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("a"));
            job.on_event(run, end("a", TestStatus::Failed, false));
            assert!(run.failure_tracker.has_reached_max_failures());
            job.on_event(run, begin("b"));
            job.on_event(run, end("b", TestStatus::Failed, false));
        });
        assert_eq!(statuses(&f.tree, b), vec![TestStatus::Interrupted]);
        assert!(f.tree[b].results[0].errors.is_empty());

        let stopped_early: Vec<_> = events
            .iter()
            .filter(|event| matches!(event.kind, TestEventKind::Error { .. }))
            .collect();
        assert_eq!(stopped_early.len(), 1, "the threshold is reported once");
    }

    #[test]
    fn skip_whole_job_reports_without_worker() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let b = f.add(f.file, "b", 0);
        for test in [a, b] {
            f.tree.test_mut(test).expected_status = TestStatus::Skipped;
        }
        let group = f.group(&[a, b]);

        let (skipped, events) = with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.skip_whole_job(run)
        });
        assert!(skipped);
        assert_eq!(statuses(&f.tree, a), vec![TestStatus::Skipped]);
        assert_eq!(events.len(), 4);
        assert_begins_before_ends(&events);
    }

    #[test]
    fn late_steps_are_ignored() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let group = f.group(&[a]);

        with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("a"));
            job.on_event(
                run,
                WorkerEvent::StepBegin(StepBeginParams {
                    test_id: "a".to_owned(),
                    step_id: "1".to_owned(),
                    parent_step_id: None,
                    title: "outer".to_owned(),
                    category: "test.step".to_owned(),
                    wall_time: 0,
                    location: None,
                }),
            );
            job.on_event(
                run,
                WorkerEvent::StepBegin(StepBeginParams {
                    test_id: "a".to_owned(),
                    step_id: "2".to_owned(),
                    parent_step_id: Some("1".to_owned()),
                    title: "inner".to_owned(),
                    category: "test.step".to_owned(),
                    wall_time: 0,
                    location: None,
                }),
            );
            job.on_event(run, end("a", TestStatus::Passed, false));
            job.on_event(
                run,
                WorkerEvent::StepEnd(StepEndParams {
                    test_id: "a".to_owned(),
                    step_id: "2".to_owned(),
                    wall_time: 10,
                    error: None,
                    annotations: Vec::new(),
                }),
            );
        });
        let result = &f.tree[a].results[0];
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].children, vec![1]);
        assert_eq!(result.root_steps().collect::<Vec<_>>(), vec![0]);
        assert_eq!(result.step_title_path(1), vec!["outer", "inner"]);
        assert_eq!(result.steps[1].duration, None, "step-end after test-end is dropped");
    }

    #[test]
    fn step_end_before_begin_has_zero_duration() {
        let mut f = Fixture::new();
        let a = f.add(f.file, "a", 0);
        let group = f.group(&[a]);

        with_run(&mut f.tree, MaxFail::All, |run| {
            let mut job = JobController::new(group, run.tree);
            job.start(run.tree, 1, 0);
            job.on_event(run, begin("a"));
            job.on_event(
                run,
                WorkerEvent::StepBegin(StepBeginParams {
                    test_id: "a".to_owned(),
                    step_id: "1".to_owned(),
                    parent_step_id: None,
                    title: "step".to_owned(),
                    category: "test.step".to_owned(),
                    wall_time: 1_000,
                    location: None,
                }),
            );
            // A garbage timestamp from the worker must not overflow.
            job.on_event(
                run,
                WorkerEvent::StepEnd(StepEndParams {
                    test_id: "a".to_owned(),
                    step_id: "1".to_owned(),
                    wall_time: i64::MIN,
                    error: None,
                    annotations: Vec::new(),
                }),
            );
        });
        assert_eq!(f.tree[a].results[0].steps[0].duration, Some(Duration::ZERO));
    }
}
