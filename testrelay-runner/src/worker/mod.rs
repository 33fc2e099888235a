// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker processes: how they are launched and how the controller talks to them.

mod channel;
mod command;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;

#[cfg(not(unix))]
#[path = "other.rs"]
mod os;

pub(crate) use channel::*;
pub use command::*;
