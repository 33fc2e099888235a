// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::FixtureValue;
use crate::errors::LoadError;
use std::collections::HashMap;
use testrelay_metadata::Location;

/// Identifies a fixture, hook or test function registered with a [`FixtureRegistry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FixtureFnId(usize);

#[derive(Clone, Debug)]
enum DeclaredParams {
    Names(Vec<String>),
    Signature(String),
}

#[derive(Clone, Debug)]
struct FixtureFn {
    declared: DeclaredParams,
    // Memoized after the first lookup, including the empty list produced by an invalid
    // declaration, so the error is only reported once.
    resolved: Option<Vec<String>>,
}

/// Identity of a fixture implementation for the purpose of registration ids.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum ValueIdentity {
    Function(FixtureFnId),
    Value(String),
    Undefined,
}

impl ValueIdentity {
    fn of(value: &FixtureValue) -> Self {
        match value {
            FixtureValue::Function(id) => Self::Function(*id),
            FixtureValue::Value(value) => Self::Value(value.to_string()),
            FixtureValue::Undefined => Self::Undefined,
        }
    }
}

/// Fixture functions and the stable registration-id table.
///
/// Registration ids feed into pool digests, so two pools built from the same declarations must
/// produce the same ids. The registry is explicit state owned by the loader rather than a
/// process-wide global.
#[derive(Clone, Debug, Default)]
pub struct FixtureRegistry {
    functions: Vec<FixtureFn>,
    by_key: HashMap<String, FixtureFnId>,
    registration_ids: HashMap<String, HashMap<ValueIdentity, String>>,
    last_id: u64,
}

impl FixtureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function with explicitly listed fixture parameters.
    ///
    /// `key` identifies the implementation: registering the same key twice returns the same id.
    pub fn define_function(
        &mut self,
        key: impl Into<String>,
        params: impl IntoIterator<Item = impl Into<String>>,
    ) -> FixtureFnId {
        let declared = DeclaredParams::Names(params.into_iter().map(Into::into).collect());
        self.define(key.into(), declared)
    }

    /// Registers a function by its source signature, for example `async ({ page, baseURL }) =>`.
    ///
    /// The first parameter must be an object destructuring pattern naming the fixtures used.
    pub fn define_function_from_signature(
        &mut self,
        key: impl Into<String>,
        signature: impl Into<String>,
    ) -> FixtureFnId {
        self.define(key.into(), DeclaredParams::Signature(signature.into()))
    }

    fn define(&mut self, key: String, declared: DeclaredParams) -> FixtureFnId {
        if let Some(id) = self.by_key.get(&key) {
            return *id;
        }
        let id = FixtureFnId(self.functions.len());
        self.functions.push(FixtureFn {
            declared,
            resolved: None,
        });
        self.by_key.insert(key, id);
        id
    }

    /// Returns the fixture names a function depends on.
    ///
    /// Values other than functions have no parameters. Errors in the declaration are reported to
    /// `sink` once; the function is then treated as having no parameters.
    pub(crate) fn parameter_names(
        &mut self,
        value: &FixtureValue,
        location: &Location,
        sink: &mut ErrorSink<'_>,
    ) -> Result<Vec<String>, LoadError> {
        let FixtureValue::Function(id) = value else {
            return Ok(Vec::new());
        };
        let function = &mut self.functions[id.0];
        if let Some(resolved) = &function.resolved {
            return Ok(resolved.clone());
        }

        let parsed = match &function.declared {
            DeclaredParams::Names(names) => check_rest_property(names).map(|()| names.clone()),
            DeclaredParams::Signature(signature) => parse_parameter_names(signature),
        };
        let names = match parsed {
            Ok(names) => names,
            Err(message) => {
                sink.add(LoadError::new(message, Some(location.clone())))?;
                Vec::new()
            }
        };
        function.resolved = Some(names.clone());
        Ok(names)
    }

    /// Returns the registration id for a fixture.
    ///
    /// Ids are keyed by name, the id of the registration being overridden, and the identity of
    /// the implementation.
    pub(crate) fn registration_id(
        &mut self,
        name: &str,
        base_id: Option<&str>,
        value: &FixtureValue,
    ) -> String {
        let key = format!("{name}@@@{}", base_id.unwrap_or_default());
        let ids = self.registration_ids.entry(key).or_default();
        let last_id = &mut self.last_id;
        ids.entry(ValueIdentity::of(value))
            .or_insert_with(|| {
                let id = last_id.to_string();
                *last_id += 1;
                id
            })
            .clone()
    }
}

/// Where load errors go: collected into a list, or returned on the first error.
pub(crate) struct ErrorSink<'e> {
    errors: Option<&'e mut Vec<LoadError>>,
}

impl<'e> ErrorSink<'e> {
    pub(crate) fn new(errors: Option<&'e mut Vec<LoadError>>) -> Self {
        Self { errors }
    }

    pub(crate) fn add(&mut self, error: LoadError) -> Result<(), LoadError> {
        match &mut self.errors {
            Some(errors) => {
                errors.push(error);
                Ok(())
            }
            None => Err(error),
        }
    }
}

fn check_rest_property(names: &[String]) -> Result<(), String> {
    match names.iter().find(|name| name.starts_with("...")) {
        Some(rest) => Err(format!(
            "Rest property \"{rest}\" is not supported. List all used fixtures explicitly, separated by comma."
        )),
        None => Ok(()),
    }
}

/// Extracts fixture names from a function signature such as `async ({ a, b: renamed }, info) =>`.
pub fn parse_parameter_names(signature: &str) -> Result<Vec<String>, String> {
    let text = strip_comments(signature);
    let Some(open) = text.find('(') else {
        return Ok(Vec::new());
    };
    let rest = &text[open + 1..];
    let params = rest.find(')').map_or(rest, |close| &rest[..close]).trim();
    if params.is_empty() {
        return Ok(Vec::new());
    }

    let first = split_by_comma(params).into_iter().next().unwrap_or_default();
    if !(first.starts_with('{') && first.ends_with('}')) {
        return Err(format!(
            "First argument must use the object destructuring pattern: {first}"
        ));
    }

    let names: Vec<String> = split_by_comma(&first[1..first.len() - 1])
        .into_iter()
        .map(|prop| match prop.find(':') {
            Some(colon) => prop[..colon].trim().to_owned(),
            None => prop.trim().to_owned(),
        })
        .collect();
    check_rest_property(&names)?;
    Ok(names)
}

fn strip_comments(s: &str) -> String {
    enum State {
        Code,
        Line,
        Block,
    }

    let mut out = String::with_capacity(s.len());
    let mut state = State::Code;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            State::Line => {
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::Block => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
            State::Code => match (c, chars.peek()) {
                ('/', Some('/')) => state = State::Line,
                ('/', Some('*')) => {
                    chars.next();
                    state = State::Block;
                }
                _ => out.push(c),
            },
        }
    }
    out
}

// Splits on top-level commas, ignoring commas nested in braces or brackets.
fn split_by_comma(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut closers = Vec::new();
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            c if closers.last() == Some(&c) => {
                closers.pop();
            }
            ',' if closers.is_empty() => {
                let token = s[start..i].trim();
                if !token.is_empty() {
                    result.push(token.to_owned());
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        result.push(last.to_owned());
    }
    result
}
