// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::RelayProfile;
use std::process::Stdio;

/// The environment variable carrying the worker index: unique for every worker in a run.
pub const WORKER_INDEX_ENV: &str = "TESTRELAY_WORKER_INDEX";

/// The environment variable carrying the parallel index: the slot the worker occupies.
pub const PARALLEL_INDEX_ENV: &str = "TESTRELAY_PARALLEL_INDEX";

/// How to launch a worker process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, Option<String>)>,
}

impl WorkerCommand {
    /// Creates a command that runs `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Creates a command from the `[worker]` section of the config.
    pub fn from_profile(profile: &RelayProfile<'_>) -> Self {
        Self::new(profile.worker_program()).args(profile.worker_args().iter().cloned())
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for every worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), Some(value.into())));
        self
    }

    /// Returns the program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Builds the process command for one worker.
    ///
    /// `extra_env` is applied last. A `None` value removes the variable.
    pub(crate) fn to_command(
        &self,
        worker_index: usize,
        parallel_index: usize,
        extra_env: &[(String, Option<String>)],
    ) -> tokio::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_INDEX_ENV, worker_index.to_string())
            .env(PARALLEL_INDEX_ENV, parallel_index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in self.env.iter().chain(extra_env) {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }
        super::os::set_process_group(&mut cmd);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}
