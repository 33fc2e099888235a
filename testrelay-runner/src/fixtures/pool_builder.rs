// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{FixturePool, FixtureRegistry, OptionOverrides};
use crate::{
    errors::LoadError,
    tree::{SuiteIndex, SuiteKind, TestIndex, TestTree, TestTypeId},
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Builds fixture pools for the tests of one project and assigns their worker hashes.
///
/// Pools are cached per test type and per suite, so tests that share ancestry share pools.
#[derive(Debug)]
pub struct PoolBuilder<'r> {
    registry: &'r mut FixtureRegistry,
    project_id: String,
    option_overrides: Option<OptionOverrides>,
    type_pools: HashMap<Option<TestTypeId>, FixturePool>,
    suite_pools: HashMap<(Option<TestTypeId>, SuiteIndex), FixturePool>,
    validated_suites: HashSet<(Option<TestTypeId>, SuiteIndex)>,
}

impl<'r> PoolBuilder<'r> {
    /// Creates a pool builder for the project represented by `project_suite`.
    pub fn for_project(
        registry: &'r mut FixtureRegistry,
        tree: &TestTree,
        project_suite: SuiteIndex,
    ) -> Self {
        let project = tree.suite(project_suite).project.as_ref();
        Self {
            registry,
            project_id: project.map(|project| project.id.clone()).unwrap_or_default(),
            option_overrides: project.and_then(|project| project.option_overrides.clone()),
            type_pools: HashMap::new(),
            suite_pools: HashMap::new(),
            validated_suites: HashSet::new(),
        }
    }

    /// Builds pools for every test under `suite`, and sets each test's worker hash to
    /// `{project}-{digest}-{repeat_each_index}`.
    ///
    /// With `errors`, load errors are collected and every test still gets a hash; without,
    /// the first load error is returned.
    pub fn build_pools(
        &mut self,
        tree: &mut TestTree,
        suite: SuiteIndex,
        mut errors: Option<&mut Vec<LoadError>>,
    ) -> Result<(), LoadError> {
        for test in tree.all_tests(suite) {
            let digest = self
                .pool_for_test(tree, test, errors.as_deref_mut())?
                .digest()
                .to_owned();
            let test = tree.test_mut(test);
            test.worker_hash = format!("{}-{digest}-{}", self.project_id, test.repeat_each_index);
        }
        Ok(())
    }

    fn pool_for_test(
        &mut self,
        tree: &TestTree,
        test_index: TestIndex,
        mut errors: Option<&mut Vec<LoadError>>,
    ) -> Result<&FixturePool, LoadError> {
        let test = tree.test(test_index);
        let test_type = test.test_type;
        self.ensure_type_pool(tree, test_type, errors.as_deref_mut())?;

        let mut parents: Vec<SuiteIndex> = tree.ancestors(test.parent).collect();
        parents.reverse();

        // The key of the pool that applies at the current depth.
        let mut current: Option<SuiteIndex> = None;
        for parent in parents {
            let suite = tree.suite(parent);
            if !suite.fixture_overrides.is_empty() {
                let key = (test_type, parent);
                if !self.suite_pools.contains_key(&key) {
                    let base = match current {
                        Some(index) => &self.suite_pools[&(test_type, index)],
                        None => &self.type_pools[&test_type],
                    };
                    let mut builder = FixturePool::builder(self.registry)
                        .parent(base)
                        .disallow_worker_fixtures(suite.kind == SuiteKind::Describe);
                    if let Some(errors) = errors.as_deref_mut() {
                        builder = builder.collect_errors(errors);
                    }
                    let pool = builder.build(&suite.fixture_overrides)?;
                    self.suite_pools.insert(key, pool);
                }
                current = Some(parent);
            }

            if self.validated_suites.insert((test_type, parent)) {
                let pool = match current {
                    Some(index) => &self.suite_pools[&(test_type, index)],
                    None => &self.type_pools[&test_type],
                };
                for hook in &suite.hooks {
                    if let Some(function) = hook.function {
                        pool.validate_function(
                            self.registry,
                            function,
                            &format!("{} hook", hook.kind),
                            &hook.location,
                            errors.as_deref_mut(),
                        )?;
                    }
                }
                for modifier in &suite.modifiers {
                    if let Some(function) = modifier.function {
                        pool.validate_function(
                            self.registry,
                            function,
                            &format!("{} modifier", modifier.kind),
                            &modifier.location,
                            errors.as_deref_mut(),
                        )?;
                    }
                }
            }
        }

        let pool = match current {
            Some(index) => &self.suite_pools[&(test_type, index)],
            None => &self.type_pools[&test_type],
        };
        if let Some(function) = test.function {
            pool.validate_function(
                self.registry,
                function,
                "Test",
                &test.location,
                errors.as_deref_mut(),
            )?;
        }
        Ok(pool)
    }

    fn ensure_type_pool(
        &mut self,
        tree: &TestTree,
        test_type: Option<TestTypeId>,
        errors: Option<&mut Vec<LoadError>>,
    ) -> Result<(), LoadError> {
        if self.type_pools.contains_key(&test_type) {
            return Ok(());
        }
        let lists = test_type
            .map(|id| tree.test_type(id).fixtures.as_slice())
            .unwrap_or_default();

        let mut builder = FixturePool::builder(self.registry);
        if let Some(overrides) = &self.option_overrides {
            builder = builder.option_overrides(overrides);
        }
        if let Some(errors) = errors {
            builder = builder.collect_errors(errors);
        }
        let pool = builder.build(lists)?;
        debug!(
            project = %self.project_id,
            digest = pool.digest(),
            "built test type pool"
        );
        self.type_pools.insert(test_type, pool);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{FixtureDecl, FixtureList, FixtureOptions, FixtureValue},
        tree::{Hook, HookKind, SuiteDecl, TestDecl, TestType, TreeDefaults},
    };
    use pretty_assertions::assert_eq;
    use testrelay_metadata::Location;

    fn loc(file: &str, line: u32) -> Location {
        Location::new(file, line, 1)
    }

    #[test]
    fn worker_hash_assignment() {
        let mut registry = FixtureRegistry::new();
        let mut tree = TestTree::new(TreeDefaults::default());
        let browser = FixtureList::new(loc("fixtures.ts", 1)).with(
            "browser",
            FixtureDecl::with_options(
                FixtureValue::Value(serde_json::json!("chromium")),
                FixtureOptions::worker(),
            ),
        );
        let base_type = tree.add_test_type(TestType {
            fixtures: vec![browser.clone()],
        });
        let other_type = tree.add_test_type(TestType {
            fixtures: vec![
                browser,
                FixtureList::new(loc("fixtures.ts", 10)).with(
                    "server",
                    FixtureDecl::with_options(
                        FixtureValue::Value(serde_json::json!(8080)),
                        FixtureOptions::worker(),
                    ),
                ),
            ],
        });

        let project = tree.add_suite(tree.root(), SuiteDecl::project("p"));
        let file = tree.add_suite(project, SuiteDecl::file("a.spec.ts"));
        let describe = tree.add_suite(
            file,
            SuiteDecl::describe("uses page").with_fixture_overrides(
                FixtureList::new(loc("a.spec.ts", 3)).with(
                    "page",
                    FixtureDecl::new(FixtureValue::Value(serde_json::json!("blank"))),
                ),
            ),
        );

        let t1 = tree
            .add_test(
                file,
                TestDecl::new("t1", "one", loc("a.spec.ts", 1)).with_test_type(base_type),
            )
            .unwrap();
        let t2 = tree
            .add_test(
                describe,
                TestDecl::new("t2", "two", loc("a.spec.ts", 4)).with_test_type(base_type),
            )
            .unwrap();
        let mut repeated = TestDecl::new("t3", "three", loc("a.spec.ts", 5)).with_test_type(base_type);
        repeated.repeat_each_index = 1;
        let t3 = tree.add_test(file, repeated).unwrap();
        let t4 = tree
            .add_test(
                file,
                TestDecl::new("t4", "four", loc("a.spec.ts", 6)).with_test_type(other_type),
            )
            .unwrap();

        let mut errors = Vec::new();
        PoolBuilder::for_project(&mut registry, &tree, project)
            .build_pools(&mut tree, project, Some(&mut errors))
            .unwrap();
        assert_eq!(errors, vec![]);

        // A describe-level override of a test fixture does not change the worker.
        assert_eq!(tree[t1].worker_hash, tree[t2].worker_hash);
        assert!(tree[t1].worker_hash.starts_with("p-"));
        assert!(tree[t1].worker_hash.ends_with("-0"));
        assert!(tree[t3].worker_hash.ends_with("-1"));
        assert_ne!(tree[t1].worker_hash, tree[t4].worker_hash);
    }

    #[test]
    fn hook_parameters_are_validated() {
        let mut registry = FixtureRegistry::new();
        let mut tree = TestTree::new(TreeDefaults::default());
        let hook = registry.define_function("hook", ["missing"]);
        let project = tree.add_suite(tree.root(), SuiteDecl::project("p"));
        let file = tree.add_suite(
            project,
            SuiteDecl::file("a.spec.ts").with_hook(Hook {
                kind: HookKind::BeforeAll,
                function: Some(hook),
                location: loc("a.spec.ts", 2),
            }),
        );
        for i in 0..3 {
            tree.add_test(
                file,
                TestDecl::new(format!("t{i}"), "test", loc("a.spec.ts", 10 + i)),
            )
            .unwrap();
        }

        let mut errors = Vec::new();
        PoolBuilder::for_project(&mut registry, &tree, project)
            .build_pools(&mut tree, project, Some(&mut errors))
            .unwrap();
        assert_eq!(
            errors
                .iter()
                .map(|error| error.message())
                .collect::<Vec<_>>(),
            vec!["beforeAll hook has unknown parameter \"missing\"."]
        );
    }
}
