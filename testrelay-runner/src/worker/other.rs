// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use tokio::process::Child;

// Process groups are a Unix concept.
pub(super) fn set_process_group(_cmd: &mut std::process::Command) {}

pub(super) fn kill_worker(child: &mut Child) {
    // Errors mean the child has already exited.
    _ = child.start_kill();
}

pub(super) fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
