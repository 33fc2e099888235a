// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testrelay.
//!
//! Configuration is read from an embedded default config, with `.config/testrelay.toml` in the
//! workspace root (or an explicitly specified file) layered on top.

mod imp;
mod max_fail;
mod workers;

pub use imp::*;
pub use max_fail::*;
pub use workers::*;
