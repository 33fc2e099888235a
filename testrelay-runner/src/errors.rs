// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testrelay.

use camino::Utf8PathBuf;
use config::ConfigError;
use std::{borrow::Cow, fmt};
use testrelay_metadata::{Location, TestError};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse testrelay config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing the config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A per-project worker limit of zero was specified.
    #[error("project `{project}` has `workers = 0`, which would never run any of its tests")]
    ZeroProjectWorkers {
        /// The project.
        project: String,
    },
}

/// An error which indicates that a profile was requested but not known to testrelay.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// Error returned while parsing a [`Workers`](crate::config::Workers) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for workers: {input}")]
pub struct WorkersParseError {
    input: String,
}

impl WorkersParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Error returned while parsing a [`MaxFail`](crate::config::MaxFail) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for max-failures: {reason}")]
pub struct MaxFailParseError {
    reason: String,
}

impl MaxFailParseError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An error that occurs while parsing a [`Shard`](crate::partition::Shard) from a string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShardParseError {
    message: Cow<'static, str>,
}

impl ShardParseError {
    pub(crate) fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "shard must be in the format \"current/total\":\n{}",
            self.message
        )
    }
}

impl std::error::Error for ShardParseError {}

/// An error found while building or validating a fixture pool.
///
/// Load errors are attributed to the file being loaded: they become errors on every test that
/// depends on the pool, not failures of the run as a whole.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{message}")]
pub struct LoadError {
    message: String,
    location: Option<Location>,
}

impl LoadError {
    pub(crate) fn new(message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the location the error points to.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Converts this into a [`TestError`] suitable for reporting.
    pub fn to_test_error(&self) -> TestError {
        TestError {
            message: self.message.clone(),
            stack: None,
            location: self.location.clone(),
        }
    }
}

/// An error that occurred while launching a worker process.
#[derive(Debug, Error)]
#[error("error spawning worker process `{program}`")]
pub struct WorkerSpawnError {
    program: String,
    #[source]
    error: std::io::Error,
}

impl WorkerSpawnError {
    pub(crate) fn new(program: impl Into<String>, error: std::io::Error) -> Self {
        Self {
            program: program.into(),
            error,
        }
    }
}

/// An error returned by a correlated call to a worker.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum WorkerCallError {
    /// The worker responded with an error.
    #[error("worker rejected call: {0}")]
    Rejected(String),

    /// The worker exited before responding.
    #[error("worker exited before responding to call")]
    Exited,
}

/// An error that occurred while bringing up a worker.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum WorkerStartError {
    /// The worker exited before it sent the ready message.
    #[error("worker exited before it became ready")]
    ExitedBeforeReady,

    /// The init call failed.
    #[error("worker initialization failed")]
    Init(#[source] WorkerCallError),
}

/// An error that occurred while constructing a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The projects in the tree could not be ordered into phases.
    #[error("error planning the run")]
    ProjectDependency(#[from] ProjectDependencyError),
}

/// A test was added to a [`TestTree`](crate::tree::TestTree) with an id that is already in use.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("duplicate test id `{id}`")]
pub struct DuplicateTestIdError {
    id: String,
}

impl DuplicateTestIdError {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// An error in the dependency relation between projects.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ProjectDependencyError {
    /// A project depends on a project that isn't part of the run.
    #[error("project `{project}` depends on unknown project `{dependency}`")]
    UnknownDependency {
        /// The dependent project.
        project: String,

        /// The missing dependency.
        dependency: String,
    },

    /// Projects depend on each other in a cycle.
    #[error("projects have a dependency cycle: {}", .projects.join(", "))]
    Cycle {
        /// The projects that could not be ordered.
        projects: Vec<String>,
    },
}

/// Displays an error along with its chain of sources, separated by `: `.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}
