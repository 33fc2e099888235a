// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker wire protocol.
//!
//! Messages are newline-delimited JSON. The controller writes [`ControllerMessage`]s to the
//! worker's standard input, and the worker writes [`WorkerMessage`]s to its standard output. Any
//! line on the worker's standard output that does not parse as a [`WorkerMessage`] is treated as
//! raw output.
//!
//! The lifecycle of a worker is:
//!
//! 1. The worker starts and sends [`WorkerMessage::Ready`].
//! 2. The controller sends a [`ControllerMessage::Call`] carrying [`WorkerRequest::Init`], and the
//!    worker answers with a [`WorkerMessage::Response`] with the same id.
//! 3. The controller sends any number of [`WorkerNotification::RunGroup`] notifications, one at a
//!    time. For each, the worker sends [`WorkerEvent`]s and finishes with [`WorkerEvent::Done`].
//! 4. The controller sends [`WorkerNotification::Stop`]. The worker may send
//!    [`WorkerEvent::EnvProduced`] and [`WorkerEvent::TeardownErrors`], then exits.
//!
//! A worker process is also free to exit on its own; the controller treats that as an unexpected
//! exit unless it asked the worker to stop.

use crate::{Annotation, Location, TestError, TestStatus};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// A message sent from the controller to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControllerMessage {
    /// A call that expects a correlated [`WorkerMessage::Response`].
    Call {
        /// The call id, unique per worker.
        id: u64,

        /// The request.
        request: WorkerRequest,
    },

    /// A fire-and-forget notification.
    Notify {
        /// The notification.
        notification: WorkerNotification,
    },
}

/// A request that expects a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum WorkerRequest {
    /// Initializes the worker. Sent once, after the worker reports that it is ready.
    Init(InitParams),
}

/// A notification sent to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum WorkerNotification {
    /// Run a group of tests.
    RunGroup(RunGroupParams),

    /// Stop after finishing any in-progress work.
    Stop,
}

/// A message sent from a worker to the controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// The worker is ready to be initialized.
    Ready,

    /// The response to a [`ControllerMessage::Call`].
    Response {
        /// The id of the call this responds to.
        id: u64,

        /// The result, if the call succeeded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,

        /// The error message, if the call failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A worker event.
    Event {
        /// The event.
        event: WorkerEvent,
    },
}

/// An event produced by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum WorkerEvent {
    /// A test attempt began.
    TestBegin(TestBeginParams),

    /// A test attempt ended.
    TestEnd(TestEndParams),

    /// A step inside a test attempt began.
    StepBegin(StepBeginParams),

    /// A step inside a test attempt ended.
    StepEnd(StepEndParams),

    /// An attachment was added to a test attempt.
    Attach(AttachmentParams),

    /// The worker finished processing the current group.
    Done(DoneParams),

    /// Environment variables produced by the worker, reported before it exits.
    EnvProduced(EnvProducedParams),

    /// Standard output emitted by the test code.
    Stdout(OutputParams),

    /// Standard error emitted by the test code.
    Stderr(OutputParams),

    /// Errors raised while tearing down worker-scoped state.
    TeardownErrors(TeardownErrorsParams),
}

/// Parameters for [`WorkerRequest::Init`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitParams {
    /// The globally unique index of this worker process.
    pub worker_index: usize,

    /// The index of the slot this worker occupies. Less than the configured worker count.
    pub parallel_index: usize,

    /// The repeat-each index shared by every group this worker will run.
    pub repeat_each_index: usize,

    /// The project every group run by this worker belongs to.
    pub project_id: String,

    /// Directory for test artifacts.
    pub artifacts_dir: Utf8PathBuf,

    /// The serialized run configuration, opaque to the controller.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Parameters for [`WorkerNotification::RunGroup`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunGroupParams {
    /// The file that declares the tests in this group.
    pub require_file: Utf8PathBuf,

    /// The tests to run, in order.
    pub entries: Vec<RunEntry>,
}

/// A single test to run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunEntry {
    /// The test id.
    pub test_id: String,

    /// The retry index of the attempt about to run. `0` for the first attempt.
    pub retry: usize,
}

/// Parameters for [`WorkerEvent::TestBegin`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestBeginParams {
    /// The test id.
    pub test_id: String,

    /// Wall-clock start time, in milliseconds since the Unix epoch.
    pub start_wall_time: i64,
}

/// Parameters for [`WorkerEvent::TestEnd`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestEndParams {
    /// The test id.
    pub test_id: String,

    /// How long the attempt took, in milliseconds.
    pub duration_ms: u64,

    /// The status of the attempt.
    pub status: TestStatus,

    /// Errors raised by the attempt.
    #[serde(default)]
    pub errors: Vec<TestError>,

    /// The expected status, which the test code may change at runtime.
    pub expected_status: TestStatus,

    /// Annotations added while running.
    #[serde(default)]
    pub annotations: Vec<Annotation>,

    /// The effective timeout, in milliseconds.
    pub timeout_ms: u64,

    /// Whether the attempt failed in a way that retrying cannot fix.
    #[serde(default)]
    pub has_nonretriable_error: bool,
}

/// Parameters for [`WorkerEvent::StepBegin`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepBeginParams {
    /// The test id.
    pub test_id: String,

    /// The step id, unique within the attempt.
    pub step_id: String,

    /// The id of the enclosing step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,

    /// The step title.
    pub title: String,

    /// The step category, for example `hook` or `test.step`.
    pub category: String,

    /// Wall-clock time the step began, in milliseconds since the Unix epoch.
    pub wall_time: i64,

    /// The source location of the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Parameters for [`WorkerEvent::StepEnd`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepEndParams {
    /// The test id.
    pub test_id: String,

    /// The step id.
    pub step_id: String,

    /// Wall-clock time the step ended, in milliseconds since the Unix epoch.
    pub wall_time: i64,

    /// The error the step failed with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,

    /// Annotations added by the step.
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// Parameters for [`WorkerEvent::Attach`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttachmentParams {
    /// The test id.
    pub test_id: String,

    /// The step the attachment belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// The attachment name.
    pub name: String,

    /// The MIME type of the attachment.
    pub content_type: String,

    /// Path to the attachment on disk, if it was written to a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,

    /// The inline attachment body, base64-encoded on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub body: Option<Vec<u8>>,
}

/// Parameters for [`WorkerEvent::Done`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DoneParams {
    /// Errors that prevented the worker from running the group to completion.
    #[serde(default)]
    pub fatal_errors: Vec<TestError>,

    /// Tests the worker skipped because of a failure in shared setup.
    #[serde(default)]
    pub skip_tests_due_to_setup_failure: Vec<String>,

    /// Tests the worker was asked to run but could not find.
    #[serde(default)]
    pub fatal_unknown_test_ids: Vec<String>,
}

/// Parameters for [`WorkerEvent::EnvProduced`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnvProducedParams {
    /// Environment variables to set (`Some`) or unset (`None`) for dependent workers.
    pub env: Vec<(String, Option<String>)>,
}

/// Parameters for [`WorkerEvent::Stdout`] and [`WorkerEvent::Stderr`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputParams {
    /// The test that produced the output, if the worker knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,

    /// Textual output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Binary output, base64-encoded on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub buffer: Option<Vec<u8>>,
}

/// Parameters for [`WorkerEvent::TeardownErrors`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TeardownErrorsParams {
    /// The errors.
    pub fatal_errors: Vec<TestError>,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
