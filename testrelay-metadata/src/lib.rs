// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Shared vocabulary for testrelay controllers and workers.
//!
//! This crate contains the types exchanged between the controller process (which schedules test
//! groups) and worker processes (which execute them):
//!
//! * [`TestStatus`], [`TestError`], [`Location`] and [`Annotation`] describe individual test
//!   attempts.
//! * The [`protocol`] module contains the worker wire protocol: newline-delimited JSON envelopes
//!   carrying one closed, tagged enum per direction.
//!
//! Worker implementations written in Rust can depend on this crate directly. Workers written in
//! other languages only need to follow the JSON shapes documented on each type.

pub mod protocol;
mod test_result;

pub use test_result::*;
