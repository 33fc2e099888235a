// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests
//!
//! These tests run real worker processes: the `fake-worker` binary from this package, which
//! follows a script passed in through the run configuration. See `test-helpers/fake-worker.rs`
//! for the script format.

use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Once;
use testrelay_metadata::TestStatus;
use testrelay_runner::{
    reporter::TestEventKind,
    runner::{RunStats, TestRunnerBuilder},
    tree::{TestIndex, TestOutcome, TestTree},
    worker::WorkerCommand,
};

mod fixtures;

use fixtures::*;

fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        color_eyre::install().expect("color-eyre installed once");
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

fn statuses(tree: &TestTree, test: TestIndex) -> Vec<TestStatus> {
    tree[test].results.iter().map(|result| result.status).collect()
}

fn first_error(tree: &TestTree, test: TestIndex) -> String {
    tree[test]
        .results
        .last()
        .and_then(|result| result.errors.first())
        .map(|error| error.message.clone())
        .unwrap_or_default()
}

#[test]
fn passing_run() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 2")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.project("p", &[], &["a", "b", "c"]);
    let mut tree = builder.build()?;

    let (stats, events) = run(&mut tree, &profile, json!({}), |_| {})?;
    assert_eq!(
        stats,
        RunStats {
            initial_run_count: 3,
            expected: 3,
            ..RunStats::default()
        }
    );
    assert!(stats.is_success());
    assert!(matches!(
        events.first().map(|event| &event.kind),
        Some(TestEventKind::RunStarted { test_count: 3, workers: 2, .. })
    ));
    assert!(matches!(
        events.last().map(|event| &event.kind),
        Some(TestEventKind::RunFinished { .. })
    ));
    Ok(())
}

#[test]
fn retry_after_failure_is_flaky() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1\nretries = 2")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.project("p", &[], &["a", "b"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "a": ["fail", "pass"] } });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.flaky, 1);
    assert_eq!(stats.expected, 1);
    assert!(stats.is_success());

    let a = &tree[tests[0]];
    assert_eq!(statuses(&tree, tests[0]), vec![TestStatus::Failed, TestStatus::Passed]);
    assert_ne!(
        a.results[0].worker_index, a.results[1].worker_index,
        "a worker that ran a failing test is not reused"
    );
    Ok(())
}

#[test]
fn second_retry_passes() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 2\nretries = 2")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.project("p", &[], &["a"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "a": ["fail", "fail", "pass"] } });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(
        statuses(&tree, tests[0]),
        vec![TestStatus::Failed, TestStatus::Failed, TestStatus::Passed]
    );
    let a = &tree[tests[0]];
    assert_eq!(a.outcome(), TestOutcome::Flaky);
    for (retry, result) in a.results.iter().take(2).enumerate() {
        assert_eq!(
            result.errors.first().map(|error| error.message.as_str()),
            Some(format!("a failed on retry {retry}").as_str()),
        );
    }
    assert_eq!(stats.flaky, 1);
    assert!(stats.is_success());
    Ok(())
}

#[test]
fn crash_fails_running_test_only() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.project("p", &[], &["a", "b", "c"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "b": ["crash"] } });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.expected, 2);
    assert_eq!(stats.unexpected, 1);
    assert_eq!(statuses(&tree, tests[1]), vec![TestStatus::Failed]);
    assert!(
        first_error(&tree, tests[1])
            .starts_with("Error: worker process exited unexpectedly (code=1"),
        "unexpected error: {}",
        first_error(&tree, tests[1])
    );
    // `c` ran in a fresh worker.
    assert_eq!(statuses(&tree, tests[2]), vec![TestStatus::Passed]);
    assert_ne!(
        tree[tests[0]].results[0].worker_index,
        tree[tests[2]].results[0].worker_index
    );
    Ok(())
}

#[test]
fn init_error_fails_group() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.project("p", &[], &["a", "b"]);
    let mut tree = builder.build()?;

    let script = json!({ "init-error": "bad config" });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.unexpected, 2);
    for test in tests {
        assert!(
            first_error(&tree, test).contains("bad config"),
            "error should mention the rejection: {}",
            first_error(&tree, test)
        );
    }
    Ok(())
}

#[test]
fn spawn_failure_fails_group() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.project("p", &[], &["a", "b"]);
    let mut tree = builder.build()?;

    let (stats, _) = run(&mut tree, &profile, json!({}), |builder| {
        builder.set_worker_command(WorkerCommand::new("/nonexistent/testrelay-worker"));
    })?;
    assert_eq!(stats.unexpected, 2);
    assert!(!stats.is_success());
    Ok(())
}

#[test]
fn max_failures_stops_run() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1\nmax-failures = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.parallel_project("p", &["a", "b", "c"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "a": ["fail"] } });
    let (stats, events) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.unexpected, 1);
    assert_eq!(stats.not_run, 2);
    assert_eq!(
        error_messages(&events),
        vec!["Testing stopped early after 1 maximum allowed failures.".to_owned()]
    );
    assert!(tree[tests[1]].results.is_empty());
    Ok(())
}

#[test]
fn unknown_test_fails() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.project("p", &[], &["a", "b"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "b": ["unknown"] } });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.expected, 1);
    assert_eq!(stats.unexpected, 1);
    assert!(first_error(&tree, tests[1]).starts_with("Test not found in the worker process"));
    Ok(())
}

#[test]
fn fatal_error_skips_rest_of_group() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.project("p", &[], &["a", "b", "c"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "b": ["fatal"] } });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(statuses(&tree, tests[0]), vec![TestStatus::Passed]);
    assert_eq!(statuses(&tree, tests[1]), vec![TestStatus::Failed]);
    assert_eq!(first_error(&tree, tests[1]), "fatal error before b");
    assert_eq!(statuses(&tree, tests[2]), vec![TestStatus::Skipped]);
    assert_eq!(stats.unexpected, 1);
    Ok(())
}

#[test]
fn project_worker_limit() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 4\n\n[profile.default.projects.p]\nworkers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.parallel_project("p", &["a", "b", "c", "d"]);
    let mut tree = builder.build()?;

    let (stats, events) = run(&mut tree, &profile, json!({}), |_| {})?;
    assert_eq!(stats.expected, 4);
    assert_eq!(max_concurrency(&events), 1);
    Ok(())
}

#[test]
fn compatible_groups_reuse_worker() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.parallel_project("p", &["a", "b", "c"]);
    let mut tree = builder.build()?;

    let (stats, _) = run(&mut tree, &profile, json!({}), |_| {})?;
    assert_eq!(stats.expected, 3);
    let worker_indexes: Vec<_> = tests
        .iter()
        .map(|&test| tree[test].results[0].worker_index)
        .collect();
    assert_eq!(worker_indexes, vec![Some(0); 3]);
    Ok(())
}

#[test]
fn raw_output_is_attributed_to_running_test() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.project("p", &[], &["a"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "a": ["print"] } });
    let (_, events) = run(&mut tree, &profile, script, |_| {})?;
    let attributed: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.kind {
            TestEventKind::Stdout { attempt, chunk } => Some((
                attempt.as_ref().map(|attempt| attempt.test_id.clone()),
                chunk.to_text_lossy().into_owned(),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(attributed.len(), 1, "events: {attributed:?}");
    assert_eq!(attributed[0].0.as_deref(), Some("a"));
    assert!(attributed[0].1.contains("raw output from a"));
    Ok(())
}

#[test]
fn dependency_env_reaches_dependents() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 2")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.project("setup", &[], &["sign-in"]);
    let tests = builder.project("main", &["setup"], &["uses-token"]);
    let mut tree = builder.build()?;

    let script = json!({
        "tests": { "uses-token": [{ "require-env": "RELAY_TOKEN" }] },
        "env": { "setup": { "RELAY_TOKEN": "abc" } },
    });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(statuses(&tree, tests[0]), vec![TestStatus::Passed]);
    assert!(stats.is_success());
    Ok(())
}

#[test]
fn failed_dependency_skips_dependents() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 2")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.project("setup", &[], &["sign-in"]);
    let tests = builder.project("main", &["setup"], &["uses-token"]);
    let mut tree = builder.build()?;

    let script = json!({ "tests": { "sign-in": ["fail"] } });
    let (stats, _) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.unexpected, 1);
    assert_eq!(stats.not_run, 1);
    assert!(tree[tests[0]].results.is_empty());
    Ok(())
}

#[test]
fn teardown_errors_fail_run() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    builder.project("p", &[], &["a"]);
    let mut tree = builder.build()?;

    let script = json!({ "teardown-error": "cleanup failed" });
    let (stats, events) = run(&mut tree, &profile, script, |_| {})?;
    assert_eq!(stats.expected, 1);
    assert!(stats.worker_errors);
    assert!(!stats.is_success());
    assert_eq!(error_messages(&events), vec!["cleanup failed".to_owned()]);
    Ok(())
}

#[test]
fn stop_interrupts_running_test() -> Result<()> {
    test_init();
    let env = TestEnv::new("workers = 1\nstop-grace-period = \"1s\"")?;
    let profile = env.profile()?;
    let mut builder = TreeBuilder::new(&profile);
    let tests = builder.parallel_project("p", &["a", "b"]);
    let mut tree = builder.build()?;

    let mut runner_builder = TestRunnerBuilder::default();
    runner_builder.set_run_config(json!({ "tests": { "a": ["hang"] } }));
    let runner = runner_builder.build(&mut tree, &profile)?;
    let stop_handle = runner.stop_handle();

    let stats = runner.execute(|event| {
        if matches!(event.kind, TestEventKind::TestStarted { .. }) {
            stop_handle.stop();
        }
    });
    assert!(stop_handle.is_stopped());
    assert_eq!(stats.not_run, 2);
    assert_eq!(statuses(&tree, tests[0]), vec![TestStatus::Interrupted]);
    assert!(tree[tests[1]].results.is_empty());
    Ok(())
}
