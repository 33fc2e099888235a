// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::{Result, WrapErr};
use testrelay_metadata::Location;
use testrelay_runner::{
    config::{RelayConfig, RelayProfile},
    fixtures::{FixtureRegistry, PoolBuilder},
    reporter::{TestEvent, TestEventKind},
    runner::{RunStats, TestRunnerBuilder},
    tree::{ParallelMode, SuiteDecl, SuiteIndex, TestDecl, TestIndex, TestTree},
};

/// A config pointing at the fake worker, in a temporary workspace.
pub struct TestEnv {
    // Kept alive for the config's artifacts directory.
    _dir: Utf8TempDir,
    config: RelayConfig,
}

impl TestEnv {
    /// Creates an environment whose default profile has `profile_toml` appended.
    pub fn new(profile_toml: &str) -> Result<Self> {
        let dir = camino_tempfile::tempdir()?;
        let config_file = dir.path().join("testrelay.toml");
        let contents = format!(
            "[worker]\nprogram = {:?}\n\n[profile.default]\n{profile_toml}\n",
            env!("CARGO_BIN_EXE_fake-worker"),
        );
        std::fs::write(&config_file, contents)
            .wrap_err_with(|| format!("writing {config_file}"))?;
        let config = RelayConfig::from_sources(dir.path(), Some(&config_file))?;
        Ok(Self { _dir: dir, config })
    }

    pub fn profile(&self) -> Result<RelayProfile<'_>> {
        Ok(self.config.profile(RelayConfig::DEFAULT_PROFILE)?)
    }
}

/// Builds a tree of projects with one file each.
pub struct TreeBuilder {
    tree: TestTree,
}

impl TreeBuilder {
    pub fn new(profile: &RelayProfile<'_>) -> Self {
        Self {
            tree: TestTree::new(profile.tree_defaults()),
        }
    }

    /// Adds a project whose tests run in order in a single group.
    pub fn project(&mut self, id: &str, dependencies: &[&str], tests: &[&str]) -> Vec<TestIndex> {
        self.add_project(id, dependencies, tests, ParallelMode::None)
    }

    /// Adds a project whose tests each form their own group.
    pub fn parallel_project(&mut self, id: &str, tests: &[&str]) -> Vec<TestIndex> {
        self.add_project(id, &[], tests, ParallelMode::Parallel)
    }

    fn add_project(
        &mut self,
        id: &str,
        dependencies: &[&str],
        tests: &[&str],
        parallel_mode: ParallelMode,
    ) -> Vec<TestIndex> {
        let root = self.tree.root();
        let project = self.tree.add_suite(
            root,
            SuiteDecl::project(id).with_dependencies(dependencies.iter().copied()),
        );
        let path = format!("{id}.spec.ts");
        let file = self.tree.add_suite(
            project,
            SuiteDecl::file(path.clone()).with_parallel_mode(parallel_mode),
        );
        tests
            .iter()
            .enumerate()
            .map(|(line, &test_id)| {
                let location = Location::new(path.clone(), line as u32 + 1, 1);
                self.tree
                    .add_test(file, TestDecl::new(test_id, test_id, location))
                    .expect("test ids are unique")
            })
            .collect()
    }

    /// Resolves fixtures for every project, assigning worker hashes.
    pub fn build(mut self) -> Result<TestTree> {
        let mut registry = FixtureRegistry::new();
        let projects: Vec<SuiteIndex> = self.tree.project_suites();
        for project in projects {
            PoolBuilder::for_project(&mut registry, &self.tree, project).build_pools(
                &mut self.tree,
                project,
                None,
            )?;
        }
        Ok(self.tree)
    }
}

/// Runs `tree` with the fake worker following `script`.
pub fn run(
    tree: &mut TestTree,
    profile: &RelayProfile<'_>,
    script: serde_json::Value,
    configure: impl FnOnce(&mut TestRunnerBuilder),
) -> Result<(RunStats, Vec<TestEvent>)> {
    let mut builder = TestRunnerBuilder::default();
    builder.set_run_config(script);
    configure(&mut builder);
    let runner = builder.build(tree, profile)?;

    let mut events = Vec::new();
    let stats = runner.execute(|event| events.push(event));
    Ok((stats, events))
}

/// Returns the messages of run-level errors.
pub fn error_messages(events: &[TestEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            TestEventKind::Error { error } => Some(error.message.clone()),
            _ => None,
        })
        .collect()
}

/// Returns the highest number of tests running at once, per the event stream.
pub fn max_concurrency(events: &[TestEvent]) -> usize {
    let mut running = 0usize;
    let mut max = 0;
    for event in events {
        match &event.kind {
            TestEventKind::TestStarted { .. } => {
                running += 1;
                max = max.max(running);
            }
            TestEventKind::TestFinished { .. } => running = running.saturating_sub(1),
            _ => {}
        }
    }
    max
}
