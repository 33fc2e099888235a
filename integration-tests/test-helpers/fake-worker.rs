// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A scripted worker process for integration tests.
//!
//! Speaks the worker protocol on stdin/stdout. What each test does is read from the run
//! configuration passed in the init call:
//!
//! ```json
//! {
//!   "tests": { "test-id": ["fail", "pass"] },
//!   "env": { "project-id": { "KEY": "value" } },
//!   "init-error": null,
//!   "teardown-error": null
//! }
//! ```
//!
//! `tests` lists one behavior per attempt, indexed by retry. The last behavior repeats for later
//! attempts, and tests that aren't listed pass. Behaviors:
//!
//! - pass, fail, skip: end the attempt with that status
//! - nonretriable: fail in a way retrying cannot fix
//! - crash: exit with code 1 after the test begins
//! - hang: begin the test and never end it
//! - unknown: report the test as not found
//! - fatal: stop the group with a fatal error
//! - print: write a raw line to stdout, then pass
//! - require-env: pass if the named variable is set, printing it; fail otherwise

use color_eyre::eyre::{Result, WrapErr};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env,
    io::{self, BufRead, Write},
    process, thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use testrelay_metadata::{
    TestError, TestStatus,
    protocol::{
        ControllerMessage, DoneParams, EnvProducedParams, RunGroupParams, TeardownErrorsParams,
        TestBeginParams, TestEndParams, WorkerEvent, WorkerMessage, WorkerNotification,
        WorkerRequest,
    },
};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct Script {
    tests: HashMap<String, Vec<Behavior>>,
    env: HashMap<String, BTreeMap<String, String>>,
    init_error: Option<String>,
    teardown_error: Option<String>,
}

impl Script {
    fn behavior(&self, test_id: &str, retry: usize) -> Behavior {
        self.tests
            .get(test_id)
            .and_then(|attempts| attempts.get(retry).or(attempts.last()))
            .cloned()
            .unwrap_or(Behavior::Pass)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Behavior {
    Pass,
    Fail,
    Skip,
    Nonretriable,
    Crash,
    Hang,
    Unknown,
    Fatal,
    Print,
    RequireEnv(String),
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let mut out = io::stdout().lock();
    send(&mut out, &WorkerMessage::Ready)?;

    let mut script = Script::default();
    let mut project_id = String::new();
    for line in io::stdin().lock().lines() {
        let line = line.wrap_err("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: ControllerMessage =
            serde_json::from_str(&line).wrap_err_with(|| format!("parsing `{line}`"))?;
        match message {
            ControllerMessage::Call {
                id,
                request: WorkerRequest::Init(params),
            } => {
                if !params.config.is_null() {
                    script = serde_json::from_value(params.config)?;
                }
                project_id = params.project_id;
                let response = match &script.init_error {
                    Some(error) => WorkerMessage::Response {
                        id,
                        result: None,
                        error: Some(error.clone()),
                    },
                    None => WorkerMessage::Response {
                        id,
                        result: Some(serde_json::Value::Null),
                        error: None,
                    },
                };
                send(&mut out, &response)?;
            }
            ControllerMessage::Notify {
                notification: WorkerNotification::RunGroup(params),
            } => run_group(&mut out, &script, params)?,
            ControllerMessage::Notify {
                notification: WorkerNotification::Stop,
            } => {
                if let Some(produced) = script.env.get(&project_id) {
                    let env = produced
                        .iter()
                        .map(|(key, value)| (key.clone(), Some(value.clone())))
                        .collect();
                    send_event(
                        &mut out,
                        WorkerEvent::EnvProduced(EnvProducedParams { env }),
                    )?;
                }
                if let Some(error) = &script.teardown_error {
                    send_event(
                        &mut out,
                        WorkerEvent::TeardownErrors(TeardownErrorsParams {
                            fatal_errors: vec![TestError::new(error.clone())],
                        }),
                    )?;
                }
                return Ok(());
            }
        }
    }

    // The controller closed stdin.
    Ok(())
}

fn run_group(out: &mut impl Write, script: &Script, params: RunGroupParams) -> Result<()> {
    let mut unknown = Vec::new();
    for entry in params.entries {
        let behavior = script.behavior(&entry.test_id, entry.retry);
        match behavior {
            Behavior::Unknown => {
                unknown.push(entry.test_id);
                continue;
            }
            Behavior::Fatal => {
                let done = DoneParams {
                    fatal_errors: vec![TestError::new(format!(
                        "fatal error before {}",
                        entry.test_id
                    ))],
                    fatal_unknown_test_ids: unknown,
                    ..DoneParams::default()
                };
                return send_event(out, WorkerEvent::Done(done));
            }
            _ => {}
        }

        send_event(
            out,
            WorkerEvent::TestBegin(TestBeginParams {
                test_id: entry.test_id.clone(),
                start_wall_time: now_millis(),
            }),
        )?;

        let mut end = TestEndParams {
            test_id: entry.test_id.clone(),
            duration_ms: 1,
            status: TestStatus::Passed,
            errors: Vec::new(),
            expected_status: TestStatus::Passed,
            annotations: Vec::new(),
            timeout_ms: 30_000,
            has_nonretriable_error: false,
        };
        match behavior {
            Behavior::Pass => {}
            Behavior::Fail => {
                end.status = TestStatus::Failed;
                end.errors.push(TestError::new(format!(
                    "{} failed on retry {}",
                    entry.test_id, entry.retry
                )));
            }
            Behavior::Skip => {
                end.status = TestStatus::Skipped;
                end.expected_status = TestStatus::Skipped;
            }
            Behavior::Nonretriable => {
                end.status = TestStatus::Failed;
                end.errors
                    .push(TestError::new(format!("{} cannot be retried", entry.test_id)));
                end.has_nonretriable_error = true;
            }
            Behavior::Crash => {
                out.flush()?;
                process::exit(1);
            }
            Behavior::Hang => loop {
                thread::sleep(Duration::from_secs(60));
            },
            Behavior::Print => {
                writeln!(out, "raw output from {}", entry.test_id)?;
            }
            Behavior::RequireEnv(key) => match env::var(&key) {
                Ok(value) => writeln!(out, "{key}={value}")?,
                Err(_) => {
                    end.status = TestStatus::Failed;
                    end.errors.push(TestError::new(format!("{key} is not set")));
                }
            },
            Behavior::Unknown | Behavior::Fatal => unreachable!("handled above"),
        }
        send_event(out, WorkerEvent::TestEnd(end))?;
    }

    send_event(
        out,
        WorkerEvent::Done(DoneParams {
            fatal_unknown_test_ids: unknown,
            ..DoneParams::default()
        }),
    )
}

fn send_event(out: &mut impl Write, event: WorkerEvent) -> Result<()> {
    send(out, &WorkerMessage::Event { event })
}

fn send(out: &mut impl Write, message: &WorkerMessage) -> Result<()> {
    serde_json::to_writer(&mut *out, message)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
