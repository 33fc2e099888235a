// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a single test attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The attempt passed.
    Passed,

    /// The attempt failed.
    Failed,

    /// The attempt ran past its timeout.
    TimedOut,

    /// The attempt was skipped.
    Skipped,

    /// The attempt was interrupted, for example because the run was stopped.
    Interrupted,
}

impl TestStatus {
    /// Returns the string used for this status on the wire and in output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Skipped => "skipped",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position in a source file.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// The file path.
    pub file: Utf8PathBuf,

    /// The 1-based line number.
    pub line: u32,

    /// The 1-based column number.
    pub column: u32,
}

impl Location {
    /// Creates a new location.
    pub fn new(file: impl Into<Utf8PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An error reported for a test attempt, or for the run as a whole.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestError {
    /// The error message.
    pub message: String,

    /// A stack trace, if one is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// The source location the error points to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl TestError {
    /// Creates an error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            location: None,
        }
    }

    /// Attaches a location to this error.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {location})")?;
        }
        Ok(())
    }
}

/// A typed annotation attached to a suite, a test, or a step.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// The annotation type, for example `skip` or `issue`.
    #[serde(rename = "type")]
    pub kind: String,

    /// An optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Annotation {
    /// Creates a new annotation.
    pub fn new(kind: impl Into<String>, description: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            description,
        }
    }
}
