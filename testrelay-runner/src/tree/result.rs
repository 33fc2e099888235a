// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset, Local, TimeZone};
use std::time::Duration;
use testrelay_metadata::{Annotation, Location, TestError, TestStatus};

/// The result of a single attempt at running a test.
#[derive(Clone, Debug)]
pub struct TestResult {
    /// The retry index. `0` for the first attempt.
    pub retry: usize,

    /// The worker that ran this attempt, if it reached a worker.
    pub worker_index: Option<usize>,

    /// The slot of the worker that ran this attempt.
    pub parallel_index: Option<usize>,

    /// When the attempt started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the attempt took. `None` until the attempt ends.
    pub duration: Option<Duration>,

    /// The status.
    pub status: TestStatus,

    /// Errors raised by the attempt.
    pub errors: Vec<TestError>,

    /// Annotations added while running.
    pub annotations: Vec<Annotation>,

    /// Attachments.
    pub attachments: Vec<Attachment>,

    /// Steps, in the order they began. Parent links index into this list.
    pub steps: Vec<TestStep>,

    /// Captured standard output.
    pub stdout: Vec<OutputChunk>,

    /// Captured standard error.
    pub stderr: Vec<OutputChunk>,
}

impl TestResult {
    pub(crate) fn new(retry: usize) -> Self {
        Self {
            retry,
            worker_index: None,
            parallel_index: None,
            start_time: Local::now().fixed_offset(),
            duration: None,
            status: TestStatus::Passed,
            errors: Vec::new(),
            annotations: Vec::new(),
            attachments: Vec::new(),
            steps: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Returns the first error, if any.
    pub fn error(&self) -> Option<&TestError> {
        self.errors.first()
    }

    /// Returns the indexes of top-level steps.
    pub fn root_steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.parent.is_none())
            .map(|(index, _)| index)
    }

    /// Returns the titles of the step at `index` and its ancestors, outermost first.
    pub fn step_title_path(&self, index: usize) -> Vec<&str> {
        let mut path: Vec<&str> =
            std::iter::successors(Some(index), |index| self.steps[*index].parent)
                .map(|index| self.steps[index].title.as_str())
                .collect();
        path.reverse();
        path
    }
}

/// A step inside a test attempt.
#[derive(Clone, Debug)]
pub struct TestStep {
    /// The step title.
    pub title: String,

    /// The step category.
    pub category: String,

    /// The enclosing step.
    pub parent: Option<usize>,

    /// Nested steps.
    pub children: Vec<usize>,

    /// When the step started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the step took. `None` until the step ends.
    pub duration: Option<Duration>,

    /// The error the step failed with.
    pub error: Option<TestError>,

    /// Indexes into [`TestResult::attachments`] for attachments added during this step.
    pub attachments: Vec<usize>,

    /// Annotations added by the step.
    pub annotations: Vec<Annotation>,

    /// Where the step was declared.
    pub location: Option<Location>,
}

/// An attachment added to a test attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// The attachment name.
    pub name: String,

    /// The MIME type.
    pub content_type: String,

    /// Path on disk, if the attachment was written to a file.
    pub path: Option<Utf8PathBuf>,

    /// Inline body.
    pub body: Option<Vec<u8>>,
}

/// A chunk of captured output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputChunk {
    /// Text output.
    Text(String),

    /// Binary output.
    Bytes(Vec<u8>),
}

impl OutputChunk {
    /// Returns the chunk as text, replacing invalid UTF-8.
    pub fn to_text_lossy(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::Text(text) => text.into(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes),
        }
    }
}

/// Converts a wall-clock time in milliseconds since the Unix epoch to a local timestamp.
pub(crate) fn wall_time(millis: i64) -> DateTime<FixedOffset> {
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.fixed_offset(),
        None => Local::now().fixed_offset(),
    }
}
