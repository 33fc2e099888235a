// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use libc::SIGKILL;
use std::os::unix::process::CommandExt;
use tokio::process::Child;

/// Puts the worker in its own process group, so that anything it spawns is killed along with it.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

/// Kills the worker's process group.
pub(super) fn kill_worker(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            // The process group id is the worker's pid, since it was created with
            // process_group(0).
            unsafe {
                libc::kill(-(pid as i32), SIGKILL);
            }
        }
        None => {
            // The child exited already -- don't send a signal.
        }
    }
}

/// Returns the signal that terminated the worker, if any.
pub(super) fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}
