// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    partition::Shard,
    runner::RunStats,
    time::{StopwatchSnapshot, StopwatchStart},
    tree::{OutputChunk, TestIndex},
};
use chrono::{DateTime, FixedOffset, Local};
use std::time::Duration;
use testrelay_metadata::{Annotation, TestError, TestStatus};

/// A test event.
///
/// Events are produced by a [`TestRunner`](crate::runner::TestRunner) and passed to the callback
/// given to [`TestRunner::execute`](crate::runner::TestRunner::execute).
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the test run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind,
}

/// Identifies one attempt at running a test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestAttempt {
    /// The test in the tree.
    pub test: TestIndex,

    /// The stable test id.
    pub test_id: String,

    /// The index of the attempt, `0` for the first run.
    pub retry: usize,
}

/// The kind of test event this is.
///
/// Forms part of [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The test run started.
    RunStarted {
        /// The profile chosen for this run.
        profile_name: String,

        /// The number of tests that will be run.
        test_count: usize,

        /// The number of worker slots.
        workers: usize,

        /// The shard being run, if any.
        shard: Option<Shard>,
    },

    /// A test started running in a worker.
    TestStarted {
        /// The attempt.
        attempt: TestAttempt,

        /// The worker running the test.
        worker_index: usize,

        /// The slot of that worker.
        parallel_index: usize,
    },

    /// A test attempt finished.
    ///
    /// Tests that never reached a worker (for example, skipped because of a crash) get a
    /// `TestFinished` without a `TestStarted`.
    TestFinished {
        /// The attempt.
        attempt: TestAttempt,

        /// The status of the attempt.
        status: TestStatus,

        /// The status the test was expected to have.
        expected_status: TestStatus,

        /// How long the attempt took.
        duration: Duration,

        /// Errors raised by the attempt.
        errors: Vec<TestError>,

        /// Annotations reported for the test.
        annotations: Vec<Annotation>,
    },

    /// A step inside a test started.
    StepStarted {
        /// The attempt.
        attempt: TestAttempt,

        /// The index of the step within the attempt's result.
        step: usize,

        /// The step title.
        title: String,

        /// The step category.
        category: String,
    },

    /// A step inside a test finished.
    StepFinished {
        /// The attempt.
        attempt: TestAttempt,

        /// The index of the step within the attempt's result.
        step: usize,

        /// The step title.
        title: String,

        /// How long the step took.
        duration: Duration,

        /// The error the step failed with.
        error: Option<TestError>,
    },

    /// Standard output produced by a worker.
    Stdout {
        /// The attempt the output is attributed to, if any.
        attempt: Option<TestAttempt>,

        /// The output.
        chunk: OutputChunk,
    },

    /// Standard error produced by a worker.
    Stderr {
        /// The attempt the output is attributed to, if any.
        attempt: Option<TestAttempt>,

        /// The output.
        chunk: OutputChunk,
    },

    /// An error not attributed to any test.
    Error {
        /// The error.
        error: TestError,
    },

    /// The test run finished.
    RunFinished {
        /// Statistics for the run.
        stats: RunStats,

        /// When the run started.
        start_time: DateTime<FixedOffset>,

        /// How long the run took.
        elapsed: Duration,
    },
}

/// Stamps events with the time and passes them on to the run's callback.
pub(crate) struct EventEmitter<'a> {
    callback: &'a mut dyn FnMut(TestEvent),
    stopwatch: StopwatchStart,
}

impl<'a> EventEmitter<'a> {
    pub(crate) fn new(callback: &'a mut dyn FnMut(TestEvent), stopwatch: StopwatchStart) -> Self {
        Self {
            callback,
            stopwatch,
        }
    }

    pub(crate) fn emit(&mut self, kind: TestEventKind) {
        (self.callback)(TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: self.stopwatch.elapsed(),
            kind,
        });
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        self.stopwatch.snapshot()
    }
}
