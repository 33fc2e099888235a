// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixture resolution.
//!
//! Tests and hooks declare the fixtures they use by name. Fixtures are declared in ordered
//! [`FixtureList`]s, and later lists may override earlier declarations of the same name. A
//! [`FixturePool`] is the result of applying a sequence of lists: it validates the dependency graph
//! between fixtures and computes a digest over the worker-scoped fixtures. Tests whose pools have
//! different digests cannot share a worker process.
//!
//! Fixture implementations themselves run inside workers. The controller only needs to know each
//! implementation's declared parameters, which are recorded in a [`FixtureRegistry`].

mod pool;
mod pool_builder;
mod registry;

pub use pool::*;
pub use pool_builder::*;
pub use registry::*;

use indexmap::IndexMap;
use std::{fmt, time::Duration};
use testrelay_metadata::Location;

/// The scope of a fixture.
///
/// Ordered: a fixture may only depend on fixtures of the same or a wider scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FixtureScope {
    /// Set up and torn down for each test.
    Test,

    /// Set up once per worker process.
    Worker,
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Test => "test",
            Self::Worker => "worker",
        })
    }
}

/// Whether a fixture is set up even when nothing names it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum FixtureAuto {
    /// Only set up when used.
    #[default]
    Off,

    /// Always set up for tests.
    On,

    /// Always set up, including for hooks.
    AllHooksIncluded,
}

impl fmt::Display for FixtureAuto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "false",
            Self::On => "true",
            Self::AllHooksIncluded => "all-hooks-included",
        })
    }
}

/// Options attached to a fixture declaration.
///
/// A declaration without options inherits the options of the declaration it overrides.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FixtureOptions {
    /// Defaults to [`FixtureAuto::Off`].
    pub auto: Option<FixtureAuto>,

    /// Defaults to [`FixtureScope::Test`].
    pub scope: Option<FixtureScope>,

    /// Whether the fixture is an option whose value may be set from configuration.
    pub option: bool,

    /// A separate timeout for the fixture's setup.
    pub timeout: Option<Duration>,

    /// A title to use instead of the name.
    pub title: Option<String>,

    /// Whether the fixture is internal and hidden from step output.
    pub boxed: bool,
}

impl FixtureOptions {
    /// Options for a worker-scoped fixture.
    pub fn worker() -> Self {
        Self {
            scope: Some(FixtureScope::Worker),
            ..Default::default()
        }
    }

    /// Options for a test-scoped fixture.
    pub fn test() -> Self {
        Self {
            scope: Some(FixtureScope::Test),
            ..Default::default()
        }
    }
}

/// The implementation of a fixture.
#[derive(Clone, Debug, PartialEq)]
pub enum FixtureValue {
    /// A function, which may depend on other fixtures.
    Function(FixtureFnId),

    /// A plain value.
    Value(serde_json::Value),

    /// No value. For option fixtures, resets the value to its configured or original default.
    Undefined,
}

/// A single fixture declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct FixtureDecl {
    /// The implementation.
    pub value: FixtureValue,

    /// Options, if given.
    pub options: Option<FixtureOptions>,
}

impl FixtureDecl {
    /// A declaration with just a value.
    pub fn new(value: FixtureValue) -> Self {
        Self {
            value,
            options: None,
        }
    }

    /// A declaration with a value and options.
    pub fn with_options(value: FixtureValue, options: FixtureOptions) -> Self {
        Self {
            value,
            options: Some(options),
        }
    }
}

/// An ordered list of fixture declarations, made at one location.
#[derive(Clone, Debug, PartialEq)]
pub struct FixtureList {
    /// Declarations, in order.
    pub fixtures: IndexMap<String, FixtureDecl>,

    /// Where the declarations were made.
    pub location: Location,
}

impl FixtureList {
    /// Creates an empty list.
    pub fn new(location: Location) -> Self {
        Self {
            fixtures: IndexMap::new(),
            location,
        }
    }

    /// Adds a declaration.
    pub fn with(mut self, name: impl Into<String>, decl: FixtureDecl) -> Self {
        self.fixtures.insert(name.into(), decl);
        self
    }
}

/// Option values set from configuration, applied right after the option fixtures they name are
/// declared.
#[derive(Clone, Debug, PartialEq)]
pub struct OptionOverrides {
    /// Values, by fixture name.
    pub values: IndexMap<String, serde_json::Value>,

    /// Where the values were configured.
    pub location: Location,
}
