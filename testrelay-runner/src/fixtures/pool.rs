// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    ErrorSink, FixtureAuto, FixtureFnId, FixtureList, FixtureRegistry, FixtureScope, FixtureValue,
    OptionOverrides,
};
use crate::errors::LoadError;
use indexmap::IndexMap;
use sha1::{Digest, Sha1};
use std::{collections::BTreeMap, collections::HashMap, time::Duration};
use testrelay_metadata::Location;
use tracing::debug;

/// A fixture as resolved in a [`FixturePool`].
#[derive(Clone, Debug)]
pub struct FixtureRegistration {
    /// The fixture name.
    pub name: String,

    /// Where the fixture was declared.
    pub location: Location,

    /// The scope.
    pub scope: FixtureScope,

    /// The implementation.
    pub value: FixtureValue,

    /// Whether the fixture is set up automatically.
    pub auto: FixtureAuto,

    /// Whether the fixture is an option.
    pub option: bool,

    /// A title to use instead of the name.
    pub custom_title: Option<String>,

    /// A separate timeout for setup.
    pub timeout: Option<Duration>,

    /// Names of the fixtures this one depends on.
    pub deps: Vec<String>,

    /// The stable registration id.
    pub id: String,

    /// Whether this registration comes from configuration option values.
    pub option_override: bool,

    /// Whether the fixture is internal.
    pub boxed: bool,

    base: Option<usize>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Marker {
    Visiting,
    Visited,
}

/// A validated set of fixtures, plus a digest over its worker-scoped fixtures.
///
/// Two pools with the same digest can share a worker process.
#[derive(Clone, Debug)]
pub struct FixturePool {
    // Overridden registrations stay in the arena so that `base` links remain valid.
    registrations: Vec<FixtureRegistration>,
    by_name: BTreeMap<String, usize>,
    digest: String,
}

impl FixturePool {
    /// Returns a builder for a new pool.
    pub fn builder(registry: &mut FixtureRegistry) -> FixturePoolBuilder<'_> {
        FixturePoolBuilder {
            registry,
            parent: None,
            disallow_worker_fixtures: false,
            option_overrides: None,
            errors: None,
        }
    }

    /// Returns the hex-encoded digest of the worker-scoped fixtures.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Returns the current registration for `name`.
    pub fn get(&self, name: &str) -> Option<&FixtureRegistration> {
        self.by_name.get(name).map(|index| &self.registrations[*index])
    }

    /// Returns the registration that fixture `name` resolves to from inside `for_fixture`.
    ///
    /// A fixture that names itself resolves to the registration it overrides.
    pub fn resolve(
        &self,
        name: &str,
        for_fixture: Option<&FixtureRegistration>,
    ) -> Option<&FixtureRegistration> {
        match for_fixture {
            Some(fixture) if fixture.name == name => {
                fixture.base.map(|base| &self.registrations[base])
            }
            _ => self.get(name),
        }
    }

    /// Returns the registration overridden by `fixture`.
    pub fn base_of(&self, fixture: &FixtureRegistration) -> Option<&FixtureRegistration> {
        fixture.base.map(|base| &self.registrations[base])
    }

    /// Returns fixtures that are set up without being named.
    pub fn auto_fixtures(&self) -> Vec<&FixtureRegistration> {
        self.by_name
            .values()
            .map(|index| &self.registrations[*index])
            .filter(|registration| registration.auto != FixtureAuto::Off)
            .collect()
    }

    /// Checks that every fixture a function depends on is known to this pool.
    ///
    /// `prefix` names the function in error messages, for example `"beforeAll hook"`.
    pub fn validate_function(
        &self,
        registry: &mut FixtureRegistry,
        function: FixtureFnId,
        prefix: &str,
        location: &Location,
        errors: Option<&mut Vec<LoadError>>,
    ) -> Result<(), LoadError> {
        let mut sink = ErrorSink::new(errors);
        let names =
            registry.parameter_names(&FixtureValue::Function(function), location, &mut sink)?;
        for name in names {
            if !self.by_name.contains_key(&name) {
                sink.add(LoadError::new(
                    format!("{prefix} has unknown parameter \"{name}\"."),
                    Some(location.clone()),
                ))?;
            }
        }
        Ok(())
    }

    fn append_fixture_list(
        &mut self,
        registry: &mut FixtureRegistry,
        list: &FixtureList,
        disallow_worker_fixtures: bool,
        is_option_override: bool,
        sink: &mut ErrorSink<'_>,
    ) -> Result<(), LoadError> {
        for (name, decl) in &list.fixtures {
            let previous = self.by_name.get(name).copied();
            let mut value = decl.value.clone();

            let (scope, auto, option, timeout, custom_title, boxed) =
                match (previous, &decl.options) {
                    (Some(previous), Some(options)) => {
                        let previous = &self.registrations[previous];
                        let scope = options.scope.unwrap_or(FixtureScope::Test);
                        let auto = options.auto.unwrap_or_default();
                        if previous.scope != scope {
                            sink.add(LoadError::new(
                                format!(
                                    "Fixture \"{name}\" has already been registered as a {{ scope: '{}' }} fixture defined in {}.",
                                    previous.scope, previous.location,
                                ),
                                Some(list.location.clone()),
                            ))?;
                            continue;
                        }
                        if previous.auto != auto {
                            sink.add(LoadError::new(
                                format!(
                                    "Fixture \"{name}\" has already been registered as a {{ auto: '{}' }} fixture defined in {}.",
                                    previous.auto, previous.location,
                                ),
                                Some(list.location.clone()),
                            ))?;
                            continue;
                        }
                        (
                            scope,
                            auto,
                            options.option,
                            options.timeout,
                            options.title.clone(),
                            options.boxed,
                        )
                    }
                    (Some(previous), None) => {
                        let previous = &self.registrations[previous];
                        (
                            previous.scope,
                            previous.auto,
                            previous.option,
                            previous.timeout,
                            previous.custom_title.clone(),
                            previous.boxed,
                        )
                    }
                    (None, Some(options)) => (
                        options.scope.unwrap_or(FixtureScope::Test),
                        options.auto.unwrap_or_default(),
                        options.option,
                        options.timeout,
                        options.title.clone(),
                        options.boxed,
                    ),
                    (None, None) => (
                        FixtureScope::Test,
                        FixtureAuto::Off,
                        false,
                        None,
                        None,
                        false,
                    ),
                };

            if scope == FixtureScope::Worker && disallow_worker_fixtures {
                sink.add(LoadError::new(
                    format!(
                        "Cannot use({{ {name} }}) in a describe group, because it forces a new worker.\nMake it top-level in the test file or put in the configuration file."
                    ),
                    Some(list.location.clone()),
                ))?;
                continue;
            }

            // An option reset to `undefined` goes back to the configured value, or to the
            // original declaration if nothing was configured.
            if value == FixtureValue::Undefined
                && option
                && let Some(previous) = previous
            {
                let mut original = &self.registrations[previous];
                while !original.option_override {
                    match original.base {
                        Some(base) => original = &self.registrations[base],
                        None => break,
                    }
                }
                value = original.value.clone();
            }

            let deps = registry.parameter_names(&value, &list.location, sink)?;
            let base_id = previous.map(|previous| self.registrations[previous].id.as_str());
            let id = registry.registration_id(name, base_id, &value);

            self.registrations.push(FixtureRegistration {
                name: name.clone(),
                location: list.location.clone(),
                scope,
                value,
                auto,
                option,
                custom_title,
                timeout,
                deps,
                id,
                option_override: is_option_override,
                boxed,
                base: previous,
            });
            self.by_name
                .insert(name.clone(), self.registrations.len() - 1);
        }
        Ok(())
    }

    fn validate(&mut self, sink: &mut ErrorSink<'_>) -> Result<(), LoadError> {
        let mut state = VisitState::default();

        // Non-boxed fixtures first: cycles through internal fixtures are reported in terms of the
        // user-visible fixtures involved.
        let order: Vec<usize> = self.by_name.values().copied().collect();
        for &index in &order {
            if !self.registrations[index].boxed && !state.markers.contains_key(&index) {
                self.visit(index, true, &mut state, sink)?;
            }
        }
        if !state.has_dependency_errors {
            for &index in &order {
                if self.registrations[index].boxed && !state.markers.contains_key(&index) {
                    self.visit(index, false, &mut state, sink)?;
                }
            }
        }

        let mut hasher = Sha1::new();
        for &index in &order {
            let registration = &self.registrations[index];
            if registration.scope == FixtureScope::Worker {
                hasher.update(registration.id.as_bytes());
                hasher.update(b";");
            }
        }
        self.digest = hex::encode(hasher.finalize());
        Ok(())
    }

    fn visit(
        &self,
        index: usize,
        boxed_only: bool,
        state: &mut VisitState,
        sink: &mut ErrorSink<'_>,
    ) -> Result<(), LoadError> {
        state.markers.insert(index, Marker::Visiting);
        state.stack.push(index);

        let registration = &self.registrations[index];
        for name in &registration.deps {
            let Some(dep) = self.resolve_index(name, index) else {
                let message = if *name == registration.name {
                    format!(
                        "Fixture \"{}\" references itself, but does not have a base implementation.",
                        registration.name
                    )
                } else {
                    format!(
                        "Fixture \"{}\" has unknown parameter \"{name}\".",
                        registration.name
                    )
                };
                state.dependency_error(sink, message, &registration.location)?;
                continue;
            };

            let dep_registration = &self.registrations[dep];
            if registration.scope > dep_registration.scope {
                let message = format!(
                    "{} fixture \"{}\" cannot depend on a {} fixture \"{name}\" defined in {}.",
                    registration.scope,
                    registration.name,
                    dep_registration.scope,
                    dep_registration.location,
                );
                state.dependency_error(sink, message, &registration.location)?;
                continue;
            }

            match state.markers.get(&dep) {
                None => self.visit(dep, boxed_only, state, sink)?,
                Some(Marker::Visiting) => {
                    let start = state
                        .stack
                        .iter()
                        .position(|entry| *entry == dep)
                        .unwrap_or_default();
                    let cycle: Vec<&FixtureRegistration> = state.stack[start..]
                        .iter()
                        .map(|entry| &self.registrations[*entry])
                        .filter(|entry| !boxed_only || !entry.boxed)
                        .collect();
                    let names: Vec<String> = cycle
                        .iter()
                        .map(|entry| format!("\"{}\"", entry.name))
                        .collect();
                    let locations: Vec<String> = cycle
                        .iter()
                        .map(|entry| entry.location.to_string())
                        .collect();
                    let message = format!(
                        "Fixtures {} -> \"{}\" form a dependency cycle: {} -> {}",
                        names.join(" -> "),
                        dep_registration.name,
                        locations.join(" -> "),
                        dep_registration.location,
                    );
                    state.dependency_error(sink, message, &dep_registration.location)?;
                }
                Some(Marker::Visited) => {}
            }
        }

        state.markers.insert(index, Marker::Visited);
        state.stack.pop();
        Ok(())
    }

    fn resolve_index(&self, name: &str, for_fixture: usize) -> Option<usize> {
        let fixture = &self.registrations[for_fixture];
        if fixture.name == name {
            fixture.base
        } else {
            self.by_name.get(name).copied()
        }
    }
}

#[derive(Default)]
struct VisitState {
    markers: HashMap<usize, Marker>,
    stack: Vec<usize>,
    has_dependency_errors: bool,
}

impl VisitState {
    fn dependency_error(
        &mut self,
        sink: &mut ErrorSink<'_>,
        message: String,
        location: &Location,
    ) -> Result<(), LoadError> {
        self.has_dependency_errors = true;
        sink.add(LoadError::new(message, Some(location.clone())))
    }
}

/// Builds a [`FixturePool`]. Created by [`FixturePool::builder`].
#[derive(Debug)]
pub struct FixturePoolBuilder<'a> {
    registry: &'a mut FixtureRegistry,
    parent: Option<&'a FixturePool>,
    disallow_worker_fixtures: bool,
    option_overrides: Option<&'a OptionOverrides>,
    errors: Option<&'a mut Vec<LoadError>>,
}

impl<'a> FixturePoolBuilder<'a> {
    /// Starts from the registrations of `parent`.
    pub fn parent(mut self, parent: &'a FixturePool) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Reports an error for any worker-scoped declaration. Used for `describe`-level overrides,
    /// which cannot change the worker.
    pub fn disallow_worker_fixtures(mut self, disallow: bool) -> Self {
        self.disallow_worker_fixtures = disallow;
        self
    }

    /// Applies configured option values.
    pub fn option_overrides(mut self, overrides: &'a OptionOverrides) -> Self {
        self.option_overrides = Some(overrides);
        self
    }

    /// Collects load errors into `errors` instead of failing on the first one.
    pub fn collect_errors(mut self, errors: &'a mut Vec<LoadError>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Applies `lists` in order and validates the result.
    pub fn build(self, lists: &[FixtureList]) -> Result<FixturePool, LoadError> {
        let mut pool = match self.parent {
            Some(parent) => FixturePool {
                registrations: parent.registrations.clone(),
                by_name: parent.by_name.clone(),
                digest: String::new(),
            },
            None => FixturePool {
                registrations: Vec::new(),
                by_name: BTreeMap::new(),
                digest: String::new(),
            },
        };
        let mut sink = ErrorSink::new(self.errors);

        for list in lists {
            pool.append_fixture_list(
                self.registry,
                list,
                self.disallow_worker_fixtures,
                false,
                &mut sink,
            )?;

            // Configured values apply right after the option declarations they override, so that
            // any later `use` still takes precedence.
            if let Some(overrides) = self.option_overrides {
                let selected: IndexMap<_, _> = list
                    .fixtures
                    .iter()
                    .filter_map(|(name, decl)| {
                        let options = decl.options.as_ref().filter(|options| options.option)?;
                        let value = overrides.values.get(name)?;
                        Some((
                            name.clone(),
                            super::FixtureDecl::with_options(
                                FixtureValue::Value(value.clone()),
                                options.clone(),
                            ),
                        ))
                    })
                    .collect();
                if !selected.is_empty() {
                    let overrides_list = FixtureList {
                        fixtures: selected,
                        location: overrides.location.clone(),
                    };
                    pool.append_fixture_list(
                        self.registry,
                        &overrides_list,
                        self.disallow_worker_fixtures,
                        true,
                        &mut sink,
                    )?;
                }
            }
        }

        pool.validate(&mut sink)?;
        debug!(
            fixtures = pool.by_name.len(),
            digest = %pool.digest,
            "built fixture pool"
        );
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureDecl, FixtureOptions};
    use pretty_assertions::assert_eq;

    fn loc(line: u32) -> Location {
        Location::new("fixtures.ts", line, 1)
    }

    fn function(registry: &mut FixtureRegistry, key: &str, params: &[&str]) -> FixtureValue {
        FixtureValue::Function(registry.define_function(key, params.iter().copied()))
    }

    fn messages(errors: &[LoadError]) -> Vec<&str> {
        errors.iter().map(|error| error.message()).collect()
    }

    #[test]
    fn digest_depends_only_on_worker_fixtures() {
        let mut registry = FixtureRegistry::new();
        let browser = function(&mut registry, "browser", &[]);
        let page_a = function(&mut registry, "page-a", &["browser"]);
        let page_b = function(&mut registry, "page-b", &["browser"]);

        let base = FixtureList::new(loc(1))
            .with(
                "browser",
                FixtureDecl::with_options(browser.clone(), FixtureOptions::worker()),
            )
            .with("page", FixtureDecl::new(page_a));
        let pool = FixturePool::builder(&mut registry)
            .build(std::slice::from_ref(&base))
            .unwrap();

        // Overriding a test fixture keeps the worker.
        let test_override = FixtureList::new(loc(2)).with("page", FixtureDecl::new(page_b));
        let child = FixturePool::builder(&mut registry)
            .parent(&pool)
            .build(&[test_override])
            .unwrap();
        assert_eq!(child.digest(), pool.digest());

        // Overriding a worker fixture requires a new worker.
        let other_browser = function(&mut registry, "other-browser", &[]);
        let worker_override = FixtureList::new(loc(3)).with(
            "browser",
            FixtureDecl::with_options(other_browser, FixtureOptions::worker()),
        );
        let child = FixturePool::builder(&mut registry)
            .parent(&pool)
            .build(&[worker_override])
            .unwrap();
        assert_ne!(child.digest(), pool.digest());

        // Rebuilding from the same declarations is stable.
        let again = FixturePool::builder(&mut registry).build(&[base]).unwrap();
        assert_eq!(again.digest(), pool.digest());
        assert_eq!(pool.digest().len(), 40);
    }

    #[test]
    fn empty_pool_digest() {
        let mut registry = FixtureRegistry::new();
        let pool = FixturePool::builder(&mut registry).build(&[]).unwrap();
        assert_eq!(pool.digest(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn cycle_reported_once() {
        let mut registry = FixtureRegistry::new();
        let a = function(&mut registry, "a", &["b"]);
        let b = function(&mut registry, "b", &["a"]);
        let list = FixtureList::new(loc(1))
            .with("a", FixtureDecl::new(a))
            .with("b", FixtureDecl::new(b));

        let mut errors = Vec::new();
        FixturePool::builder(&mut registry)
            .collect_errors(&mut errors)
            .build(&[list])
            .unwrap();
        assert_eq!(
            messages(&errors),
            vec![
                "Fixtures \"a\" -> \"b\" -> \"a\" form a dependency cycle: fixtures.ts:1:1 -> fixtures.ts:1:1 -> fixtures.ts:1:1"
            ]
        );
    }

    #[test]
    fn without_sink_first_error_is_returned() {
        let mut registry = FixtureRegistry::new();
        let a = function(&mut registry, "a", &["missing", "also-missing"]);
        let list = FixtureList::new(loc(1)).with("a", FixtureDecl::new(a));
        let error = FixturePool::builder(&mut registry)
            .build(&[list])
            .unwrap_err();
        assert_eq!(
            error.message(),
            "Fixture \"a\" has unknown parameter \"missing\"."
        );
        assert_eq!(error.location(), Some(&loc(1)));
    }

    #[test]
    fn dependency_errors() {
        let mut registry = FixtureRegistry::new();
        let page = function(&mut registry, "page", &[]);
        let browser = function(&mut registry, "browser", &["page"]);
        let self_ref = function(&mut registry, "self", &["selfish"]);
        let list = FixtureList::new(loc(1))
            .with("page", FixtureDecl::new(page))
            .with(
                "browser",
                FixtureDecl::with_options(browser, FixtureOptions::worker()),
            )
            .with("selfish", FixtureDecl::new(self_ref));

        let mut errors = Vec::new();
        FixturePool::builder(&mut registry)
            .collect_errors(&mut errors)
            .build(&[list])
            .unwrap();
        assert_eq!(
            messages(&errors),
            vec![
                "worker fixture \"browser\" cannot depend on a test fixture \"page\" defined in fixtures.ts:1:1.",
                "Fixture \"selfish\" references itself, but does not have a base implementation.",
            ]
        );
    }

    #[test]
    fn self_reference_resolves_to_base() {
        let mut registry = FixtureRegistry::new();
        let base = function(&mut registry, "base", &[]);
        let wrapper = function(&mut registry, "wrapper", &["page"]);
        let pool = FixturePool::builder(&mut registry)
            .build(&[
                FixtureList::new(loc(1)).with("page", FixtureDecl::new(base.clone())),
                FixtureList::new(loc(2)).with("page", FixtureDecl::new(wrapper)),
            ])
            .unwrap();

        let page = pool.get("page").unwrap();
        assert_eq!(page.location, loc(2));
        let resolved = pool.resolve("page", Some(page)).unwrap();
        assert_eq!(resolved.value, base);
        assert_eq!(pool.base_of(page).unwrap().location, loc(1));
    }

    #[test]
    fn conflicting_options() {
        let mut registry = FixtureRegistry::new();
        let value = FixtureValue::Value(serde_json::json!(1));
        let mut errors = Vec::new();
        FixturePool::builder(&mut registry)
            .collect_errors(&mut errors)
            .build(&[
                FixtureList::new(loc(1))
                    .with(
                        "w",
                        FixtureDecl::with_options(value.clone(), FixtureOptions::worker()),
                    )
                    .with("a", FixtureDecl::new(value.clone())),
                FixtureList::new(loc(2))
                    .with(
                        "w",
                        FixtureDecl::with_options(value.clone(), FixtureOptions::test()),
                    )
                    .with(
                        "a",
                        FixtureDecl::with_options(
                            value,
                            FixtureOptions {
                                auto: Some(FixtureAuto::On),
                                ..Default::default()
                            },
                        ),
                    ),
            ])
            .unwrap();
        assert_eq!(
            messages(&errors),
            vec![
                "Fixture \"w\" has already been registered as a { scope: 'worker' } fixture defined in fixtures.ts:1:1.",
                "Fixture \"a\" has already been registered as a { auto: 'false' } fixture defined in fixtures.ts:1:1.",
            ]
        );
    }

    #[test]
    fn worker_fixtures_disallowed_in_describe() {
        let mut registry = FixtureRegistry::new();
        let base = FixturePool::builder(&mut registry)
            .build(&[FixtureList::new(loc(1)).with(
                "browser",
                FixtureDecl::with_options(
                    FixtureValue::Value(serde_json::json!("chromium")),
                    FixtureOptions::worker(),
                ),
            )])
            .unwrap();

        let mut errors = Vec::new();
        let child = FixturePool::builder(&mut registry)
            .parent(&base)
            .disallow_worker_fixtures(true)
            .collect_errors(&mut errors)
            .build(&[FixtureList::new(loc(5)).with(
                "browser",
                FixtureDecl::new(FixtureValue::Value(serde_json::json!("firefox"))),
            )])
            .unwrap();
        assert_eq!(
            messages(&errors),
            vec![
                "Cannot use({ browser }) in a describe group, because it forces a new worker.\nMake it top-level in the test file or put in the configuration file."
            ]
        );
        assert_eq!(child.digest(), base.digest());
    }

    #[test]
    fn option_overrides_and_reset() {
        let mut registry = FixtureRegistry::new();
        let option = FixtureOptions {
            option: true,
            ..Default::default()
        };
        let declared = FixtureList::new(loc(1)).with(
            "locale",
            FixtureDecl::with_options(FixtureValue::Value(serde_json::json!("en-US")), option),
        );
        let overrides = OptionOverrides {
            values: [("locale".to_owned(), serde_json::json!("de-DE"))]
                .into_iter()
                .collect(),
            location: Location::new("config.ts", 1, 1),
        };
        let pool = FixturePool::builder(&mut registry)
            .option_overrides(&overrides)
            .build(&[
                declared,
                FixtureList::new(loc(2)).with(
                    "locale",
                    FixtureDecl::new(FixtureValue::Value(serde_json::json!("fr-FR"))),
                ),
                FixtureList::new(loc(3)).with("locale", FixtureDecl::new(FixtureValue::Undefined)),
            ])
            .unwrap();

        let locale = pool.get("locale").unwrap();
        assert_eq!(locale.value, FixtureValue::Value(serde_json::json!("de-DE")));
        assert_eq!(locale.location, loc(3));
    }

    #[test]
    fn validate_function_and_auto_fixtures() {
        let mut registry = FixtureRegistry::new();
        let auto = FixtureOptions {
            auto: Some(FixtureAuto::On),
            ..Default::default()
        };
        let pool = FixturePool::builder(&mut registry)
            .build(&[FixtureList::new(loc(1))
                .with("page", FixtureDecl::new(FixtureValue::Value(serde_json::json!(1))))
                .with(
                    "trace",
                    FixtureDecl::with_options(FixtureValue::Value(serde_json::json!(2)), auto),
                )])
            .unwrap();
        assert_eq!(
            pool.auto_fixtures()
                .iter()
                .map(|fixture| fixture.name.as_str())
                .collect::<Vec<_>>(),
            vec!["trace"]
        );

        let hook = registry.define_function("hook", ["page", "context"]);
        let mut errors = Vec::new();
        pool.validate_function(&mut registry, hook, "beforeAll hook", &loc(9), Some(&mut errors))
            .unwrap();
        assert_eq!(
            messages(&errors),
            vec!["beforeAll hook has unknown parameter \"context\"."]
        );
    }
}
