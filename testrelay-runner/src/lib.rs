// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Test scheduling and worker-process orchestration for testrelay.
//!
//! The basic flow of a run:
//!
//! 1. Build a [`TestTree`](tree::TestTree) from discovered tests.
//! 2. Resolve fixtures with a [`PoolBuilder`](fixtures::PoolBuilder), which assigns each test the
//!    hash of the worker it needs.
//! 3. Build a [`TestRunner`](runner::TestRunner). This orders projects into phases and splits
//!    each project into [`TestGroup`](groups::TestGroup)s.
//! 4. Execute the runner. Groups are handed to worker processes, and results are recorded in the
//!    tree and reported through a callback.

pub mod config;
pub mod errors;
pub mod fixtures;
pub mod groups;
pub mod partition;
pub mod plan;
pub mod reporter;
pub mod runner;
mod time;
pub mod tree;
pub mod worker;
