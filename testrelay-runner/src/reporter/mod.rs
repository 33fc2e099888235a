// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events produced while running tests.
//!
//! Rendering is left to the caller: the runner passes every [`TestEvent`] to a callback.

mod events;

pub use events::*;
