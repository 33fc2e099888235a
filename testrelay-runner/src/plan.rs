// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordering projects and their groups into a run.
//!
//! Projects can depend on other projects (for example, a setup project that signs in and
//! produces credentials). A [`RunPlan`] is a list of phases: each phase contains the projects
//! whose dependencies all ran in earlier phases.

use crate::{
    errors::ProjectDependencyError,
    groups::{TestGroup, create_test_groups},
    partition::{Shard, filter_for_shard},
    tree::{SuiteIndex, TestTree},
};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// A project scheduled as part of a [`RunPhase`].
#[derive(Clone, Debug)]
pub struct PlannedProject {
    /// The project id.
    pub id: String,

    /// The project suite.
    pub suite: SuiteIndex,

    /// The projects this project depends on.
    pub dependencies: Vec<String>,

    /// The groups to run for this project.
    pub groups: Vec<TestGroup>,
}

/// Projects that can run concurrently.
#[derive(Clone, Debug, Default)]
pub struct RunPhase {
    /// The projects in this phase.
    pub projects: Vec<PlannedProject>,
}

impl RunPhase {
    /// Returns every group in this phase, in project order.
    pub fn groups(&self) -> impl Iterator<Item = &TestGroup> + '_ {
        self.projects.iter().flat_map(|project| &project.groups)
    }
}

/// The groups of a run, ordered into phases by project dependencies.
#[derive(Clone, Debug)]
pub struct RunPlan {
    phases: Vec<RunPhase>,
}

impl RunPlan {
    /// Builds a plan for every project in `tree`.
    ///
    /// With a shard, only the groups of top-level projects (projects nothing depends on) are
    /// sharded. Groups of dependency projects are always included in full.
    pub fn new(
        tree: &TestTree,
        workers: usize,
        shard: Option<&Shard>,
    ) -> Result<Self, ProjectDependencyError> {
        let mut projects = Vec::new();
        for suite in tree.project_suites() {
            let Some(info) = tree.suite(suite).project.as_ref() else {
                continue;
            };
            projects.push(PlannedProject {
                id: info.id.clone(),
                suite,
                dependencies: info.dependencies.clone(),
                groups: Vec::new(),
            });
        }

        let known: HashSet<&str> = projects.iter().map(|project| project.id.as_str()).collect();
        let mut depended_on = HashSet::new();
        for project in &projects {
            for dependency in &project.dependencies {
                if !known.contains(dependency.as_str()) {
                    return Err(ProjectDependencyError::UnknownDependency {
                        project: project.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                depended_on.insert(dependency.clone());
            }
        }

        let top_level: Vec<SuiteIndex> = projects
            .iter()
            .filter(|project| !depended_on.contains(&project.id))
            .map(|project| project.suite)
            .collect();
        let mut top_level_groups = create_test_groups(tree, &top_level, workers);
        if let Some(shard) = shard {
            let before = top_level_groups.len();
            top_level_groups = filter_for_shard(top_level_groups, shard);
            debug!(
                %shard,
                before,
                after = top_level_groups.len(),
                "filtered groups for shard"
            );
        }

        for project in &mut projects {
            project.groups = if depended_on.contains(&project.id) {
                create_test_groups(tree, &[project.suite], workers)
            } else {
                top_level_groups
                    .iter()
                    .filter(|group| group.project_id == project.id)
                    .cloned()
                    .collect()
            };
        }

        let mut phases = Vec::new();
        let mut processed: BTreeSet<String> = BTreeSet::new();
        while !projects.is_empty() {
            let (ready, waiting): (Vec<_>, Vec<_>) = projects.into_iter().partition(|project| {
                project
                    .dependencies
                    .iter()
                    .all(|dependency| processed.contains(dependency))
            });
            if ready.is_empty() {
                return Err(ProjectDependencyError::Cycle {
                    projects: waiting.into_iter().map(|project| project.id).collect(),
                });
            }
            processed.extend(ready.iter().map(|project| project.id.clone()));
            phases.push(RunPhase { projects: ready });
            projects = waiting;
        }

        Ok(Self { phases })
    }

    /// Returns the phases, in the order they run.
    pub fn phases(&self) -> &[RunPhase] {
        &self.phases
    }

    /// Returns the total number of groups.
    pub fn group_count(&self) -> usize {
        self.phases.iter().map(|phase| phase.groups().count()).sum()
    }

    /// Returns the total number of tests.
    pub fn test_count(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|phase| phase.groups())
            .map(|group| group.tests.len())
            .sum()
    }
}
