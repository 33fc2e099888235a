// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]. It runs a [`RunPlan`](crate::plan::RunPlan)
//! phase by phase, each phase through a scheduler that hands groups to a bounded pool of
//! worker processes.

mod failure_tracker;
mod imp;
mod job;
mod scheduler;
mod stats;

pub(crate) use failure_tracker::*;
pub use imp::*;
pub(crate) use job::*;
pub(crate) use scheduler::*;
pub use stats::*;
