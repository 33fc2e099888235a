// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{EnvByProject, FailureTracker, RunContext, RunStats, Scheduler, SchedulerSettings};
use crate::{
    config::{MaxFail, RelayProfile, Workers},
    errors::TestRunnerBuildError,
    partition::Shard,
    plan::RunPlan,
    reporter::{EventEmitter, TestEvent, TestEventKind},
    time::stopwatch,
    tree::{TestIndex, TestTree},
    worker::WorkerCommand,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{runtime::Runtime, sync::watch};
use tracing::{debug, info};

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    workers: Option<Workers>,
    max_failures: Option<MaxFail>,
    shard: Option<Shard>,
    command: Option<WorkerCommand>,
    retire_redundant_workers: Option<bool>,
    run_config: serde_json::Value,
}

impl TestRunnerBuilder {
    /// Sets the number of worker slots.
    pub fn set_workers(&mut self, workers: Workers) -> &mut Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the max-failures value for this test runner.
    pub fn set_max_failures(&mut self, max_failures: MaxFail) -> &mut Self {
        self.max_failures = Some(max_failures);
        self
    }

    /// Runs only the given shard of the top-level projects.
    pub fn set_shard(&mut self, shard: Shard) -> &mut Self {
        self.shard = Some(shard);
        self
    }

    /// Overrides the worker command from the profile.
    pub fn set_worker_command(&mut self, command: WorkerCommand) -> &mut Self {
        self.command = Some(command);
        self
    }

    /// Sets whether a worker is stopped once nothing left in the queue can reuse it.
    ///
    /// Defaults to true. Turning it off keeps idle workers around until the end of a phase.
    pub fn set_retire_redundant_workers(&mut self, retire: bool) -> &mut Self {
        self.retire_redundant_workers = Some(retire);
        self
    }

    /// Sets the configuration value handed to every worker in its initialization call.
    pub fn set_run_config(&mut self, run_config: serde_json::Value) -> &mut Self {
        self.run_config = run_config;
        self
    }

    /// Creates a new test runner.
    ///
    /// `tree` must already have worker hashes assigned to its tests.
    pub fn build<'a>(
        self,
        tree: &'a mut TestTree,
        profile: &RelayProfile<'_>,
    ) -> Result<TestRunner<'a>, TestRunnerBuildError> {
        let workers = self
            .workers
            .unwrap_or_else(|| profile.workers())
            .compute();
        let max_failures = self.max_failures.unwrap_or_else(|| profile.max_failures());
        let plan = RunPlan::new(tree, workers, self.shard.as_ref())?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testrelay-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(TestRunner {
            inner: TestRunnerInner {
                profile_name: profile.name().to_owned(),
                tree,
                plan,
                shard: self.shard,
                max_failures,
                settings: SchedulerSettings {
                    command: self
                        .command
                        .unwrap_or_else(|| WorkerCommand::from_profile(profile)),
                    workers,
                    project_limits: profile.project_worker_limits(),
                    stop_grace_period: profile.stop_grace_period(),
                    artifacts_dir: profile.artifacts_dir(),
                    run_config: self.run_config,
                    retire_redundant_workers: self.retire_redundant_workers.unwrap_or(true),
                },
                runtime,
                stop_rx,
            },
            stop_handle: StopHandle {
                sender: Arc::new(stop_tx),
            },
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<'a> {
    inner: TestRunnerInner<'a>,
    stop_handle: StopHandle,
}

impl<'a> TestRunner<'a> {
    /// Returns the plan this runner executes.
    pub fn plan(&self) -> &RunPlan {
        &self.inner.plan
    }

    /// Returns a handle that stops the run from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Executes the plan, one phase at a time.
    ///
    /// The callback is called with every event of the run. Results are also recorded in the
    /// tree passed to [`TestRunnerBuilder::build`].
    pub fn execute<F>(self, mut callback: F) -> RunStats
    where
        F: FnMut(TestEvent),
    {
        let TestRunnerInner {
            profile_name,
            tree,
            plan,
            shard,
            max_failures,
            settings,
            runtime,
            stop_rx,
        } = self.inner;

        let tests: Vec<TestIndex> = plan
            .phases()
            .iter()
            .flat_map(|phase| phase.groups())
            .flat_map(|group| group.tests.iter().copied())
            .collect();

        info!(
            profile = %profile_name,
            workers = settings.workers,
            max_failures = %max_failures,
            tests = tests.len(),
            "starting run"
        );
        let mut run = RunContext {
            tree,
            failure_tracker: FailureTracker::new(max_failures),
            emitter: EventEmitter::new(&mut callback, stopwatch()),
            next_worker_index: 0,
        };
        run.emitter.emit(TestEventKind::RunStarted {
            profile_name,
            test_count: tests.len(),
            workers: settings.workers,
            shard,
        });

        runtime.block_on(run_phases(&mut run, &plan, &settings, stop_rx));

        // Worker output readers can outlive their process if a grandchild holds the pipe open.
        // Shut the runtime down without waiting for them.
        runtime.shutdown_background();

        let stats = RunStats::from_tree(
            run.tree,
            &tests,
            run.failure_tracker.has_worker_errors(),
        );
        let snapshot = run.emitter.snapshot();
        run.emitter.emit(TestEventKind::RunFinished {
            stats,
            start_time: snapshot.start_time,
            elapsed: snapshot.duration,
        });
        stats
    }
}

#[derive(Debug)]
struct TestRunnerInner<'a> {
    profile_name: String,
    tree: &'a mut TestTree,
    plan: RunPlan,
    shard: Option<Shard>,
    max_failures: MaxFail,
    settings: SchedulerSettings,
    runtime: Runtime,
    stop_rx: watch::Receiver<bool>,
}

async fn run_phases(
    run: &mut RunContext<'_>,
    plan: &RunPlan,
    settings: &SchedulerSettings,
    stop_rx: watch::Receiver<bool>,
) {
    let mut successful: HashSet<String> = HashSet::new();
    let mut extra_env: EnvByProject = HashMap::new();

    for (index, phase) in plan.phases().iter().enumerate() {
        let mut groups = Vec::new();
        for project in &phase.projects {
            let mut env = Vec::new();
            for dependency in &project.dependencies {
                if let Some(dependency_env) = extra_env.get(dependency) {
                    merge_env(&mut env, dependency_env);
                }
            }
            extra_env.insert(project.id.clone(), env);

            if has_failed_dependencies(&project.dependencies, &successful) {
                info!(project = %project.id, "skipping project: a dependency failed");
                continue;
            }
            groups.extend(project.groups.iter().cloned());
        }

        if !groups.is_empty() {
            debug!(phase = index, groups = groups.len(), "running phase");
            let produced = Scheduler::new(run, settings, &extra_env, stop_rx.clone())
                .run(groups)
                .await;
            for (project_id, env) in produced {
                merge_env(extra_env.entry(project_id).or_default(), &env);
            }
        }

        // A worker error can't be attributed to a project, so nothing counts as successful.
        if run.failure_tracker.has_worker_errors() {
            continue;
        }
        for project in &phase.projects {
            if has_failed_dependencies(&project.dependencies, &successful) {
                continue;
            }
            let all_ok = run
                .tree
                .all_tests(project.suite)
                .into_iter()
                .all(|test| run.tree.test(test).ok());
            if all_ok {
                successful.insert(project.id.clone());
            }
        }
    }
}

fn has_failed_dependencies(dependencies: &[String], successful: &HashSet<String>) -> bool {
    dependencies
        .iter()
        .any(|dependency| !successful.contains(dependency))
}

/// Merges `from` into `into`. A variable in `from` replaces the same variable in `into`.
fn merge_env(into: &mut Vec<(String, Option<String>)>, from: &[(String, Option<String>)]) {
    for (key, value) in from {
        match into.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value.clone(),
            None => into.push((key.clone(), value.clone())),
        }
    }
}

/// Stops a running [`TestRunner`].
///
/// Stopping is idempotent: workers get a single stop request and queued groups are not
/// scheduled. Tests that were running when the stop arrived are reported as interrupted.
#[derive(Clone, Debug)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Requests a stop.
    pub fn stop(&self) {
        self.sender.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    /// Returns true if a stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.map(str::to_owned)))
            .collect()
    }

    #[test]
    fn merge_env_replaces_keys() {
        let mut into = env(&[("A", Some("1")), ("B", Some("2"))]);
        merge_env(&mut into, &env(&[("B", None), ("C", Some("3"))]));
        assert_eq!(into, env(&[("A", Some("1")), ("B", None), ("C", Some("3"))]));
    }

    #[test]
    fn stop_handle_is_idempotent() {
        let (sender, mut receiver) = watch::channel(false);
        let handle = StopHandle {
            sender: Arc::new(sender),
        };
        assert!(!handle.is_stopped());
        handle.stop();
        assert!(receiver.has_changed().unwrap());
        assert!(*receiver.borrow_and_update());
        handle.stop();
        assert!(!receiver.has_changed().unwrap(), "second stop is a no-op");
        assert!(handle.is_stopped());
    }
}
