// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduler: matches queued groups to worker slots.
//!
//! The scheduler runs as a single loop that owns all of its state. Work that has to wait on a
//! worker process (stopping a worker before reusing its slot, or waiting for a new worker to
//! come up) runs in a separate task that reports back to the loop through the same channel as
//! worker output. Every decision about slots and the queue is made synchronously on the loop,
//! between two channel receives.

use super::{FailureTracker, JobController, JobResult};
use crate::{
    errors::{DisplayErrorChain, WorkerStartError},
    groups::TestGroup,
    reporter::{EventEmitter, TestAttempt, TestEventKind},
    tree::{OutputChunk, TestTree},
    worker::{WorkerCommand, WorkerEnvelope, WorkerHandle, WorkerOutput, WorkerSpec},
};
use camino::Utf8PathBuf;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    time::Duration,
};
use testrelay_metadata::{
    TestError,
    protocol::{InitParams, OutputParams, WorkerEvent},
};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    watch,
};
use tracing::{debug, info, warn};

/// Environment variables by project id.
pub(crate) type EnvByProject = HashMap<String, Vec<(String, Option<String>)>>;

/// State shared by every scheduler in a run.
pub(crate) struct RunContext<'a> {
    pub(crate) tree: &'a mut TestTree,
    pub(crate) failure_tracker: FailureTracker,
    pub(crate) emitter: EventEmitter<'a>,
    pub(crate) next_worker_index: usize,
}

/// Settings for a scheduler.
#[derive(Clone, Debug)]
pub(crate) struct SchedulerSettings {
    pub(crate) command: WorkerCommand,
    pub(crate) workers: usize,
    pub(crate) project_limits: BTreeMap<String, usize>,
    pub(crate) stop_grace_period: Duration,
    pub(crate) artifacts_dir: Utf8PathBuf,
    pub(crate) run_config: serde_json::Value,
    pub(crate) retire_redundant_workers: bool,
}

#[derive(Debug)]
enum SchedulerEvent {
    Worker(WorkerEnvelope),

    /// The worker previously in `slot` has exited so the slot can get a fresh one.
    Restarted { slot: usize, old_worker: usize },

    /// A new worker finished its handshake, or failed to.
    Started {
        slot: usize,
        worker_index: usize,
        result: Result<(), TestError>,
    },
}

impl From<WorkerEnvelope> for SchedulerEvent {
    fn from(envelope: WorkerEnvelope) -> Self {
        Self::Worker(envelope)
    }
}

#[derive(Debug)]
enum JobState {
    /// Waiting for the slot's worker to be replaced or to come up.
    Preparing,

    /// The group was sent to the worker.
    Running,
}

#[derive(Debug)]
struct ActiveJob {
    controller: JobController,
    state: JobState,
}

#[derive(Debug, Default)]
struct WorkerSlot {
    busy: bool,
    worker: Option<WorkerHandle>,
    job: Option<ActiveJob>,
}

pub(crate) struct Scheduler<'r, 'a> {
    run: &'r mut RunContext<'a>,
    settings: &'r SchedulerSettings,
    extra_env: &'r EnvByProject,
    produced_env: EnvByProject,
    slots: Vec<WorkerSlot>,
    queue: VecDeque<TestGroup>,
    queued_or_running: HashMap<String, usize>,
    worker_projects: HashMap<usize, String>,
    live_workers: HashSet<usize>,
    stopped: bool,
    slot_freed: bool,
    events_tx: UnboundedSender<SchedulerEvent>,
    events_rx: UnboundedReceiver<SchedulerEvent>,
    stop_rx: watch::Receiver<bool>,
}

impl<'r, 'a> Scheduler<'r, 'a> {
    pub(crate) fn new(
        run: &'r mut RunContext<'a>,
        settings: &'r SchedulerSettings,
        extra_env: &'r EnvByProject,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            run,
            settings,
            extra_env,
            produced_env: HashMap::new(),
            slots: (0..settings.workers.max(1))
                .map(|_| WorkerSlot::default())
                .collect(),
            queue: VecDeque::new(),
            queued_or_running: HashMap::new(),
            worker_projects: HashMap::new(),
            live_workers: HashSet::new(),
            stopped: true,
            slot_freed: false,
            events_tx,
            events_rx,
            stop_rx,
        }
    }

    /// Runs `groups` to completion, or until stopped. Returns the environment produced by the
    /// workers, by project.
    pub(crate) async fn run(mut self, groups: Vec<TestGroup>) -> EnvByProject {
        for group in &groups {
            self.update_hash_count(&group.worker_hash, 1);
        }
        self.queue = groups.into();
        self.stopped = false;
        if self.run.failure_tracker.has_reached_max_failures() || *self.stop_rx.borrow() {
            self.stop();
        }

        self.schedule();
        let mut stop_handle_alive = true;
        while !self.is_finished() {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    // The scheduler holds a sender, so this can't happen.
                    None => break,
                },
                result = self.stop_rx.changed(), if stop_handle_alive => match result {
                    Ok(()) => {
                        if *self.stop_rx.borrow_and_update() {
                            info!("stop requested");
                            self.stop();
                        }
                    }
                    Err(_) => stop_handle_alive = false,
                },
            }
        }

        self.shutdown().await;
        self.produced_env
    }

    fn is_finished(&self) -> bool {
        (self.queue.is_empty() || self.stopped) && !self.slots.iter().any(|slot| slot.busy)
    }

    /// Stops scheduling new groups and asks every worker to stop. Idempotent.
    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        debug!(queued = self.queue.len(), "stopping scheduler");
        self.stopped = true;
        for worker in self.slots.iter().filter_map(|slot| slot.worker.as_ref()) {
            worker.stop(false);
        }
    }

    /// Stops all workers and waits for them to exit, so that their produced environment is
    /// recorded.
    async fn shutdown(&mut self) {
        for worker in self.slots.iter().filter_map(|slot| slot.worker.as_ref()) {
            worker.stop(false);
        }
        while !self.live_workers.is_empty() {
            match self.events_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    /// Claims slots for as many queued groups as possible.
    ///
    /// Runs synchronously: a group and a slot are claimed together, with no suspension point in
    /// between.
    fn schedule(&mut self) {
        while !self.stopped {
            let Some(job_index) = self.find_first_job_to_run() else {
                return;
            };
            let hash = &self.queue[job_index].worker_hash;
            let slot = self
                .slots
                .iter()
                .position(|slot| {
                    !slot.busy
                        && slot
                            .worker
                            .as_ref()
                            .is_some_and(|worker| worker.hash() == hash && !worker.did_send_stop())
                })
                .or_else(|| self.slots.iter().position(|slot| !slot.busy));
            let Some(slot) = slot else {
                return;
            };

            let Some(group) = self.queue.remove(job_index) else {
                return;
            };
            debug!(
                slot,
                project = %group.project_id,
                file = %group.require_file,
                tests = group.tests.len(),
                "claimed slot for group"
            );
            let mut controller = JobController::new(group, self.run.tree);
            self.slots[slot].busy = true;

            if controller.skip_whole_job(self.run) {
                self.finish_job(slot, controller.group().worker_hash.clone(), None);
                self.check_max_failures();
                continue;
            }
            self.slots[slot].job = Some(ActiveJob {
                controller,
                state: JobState::Preparing,
            });
            self.prepare_slot(slot);
        }
    }

    fn find_first_job_to_run(&self) -> Option<usize> {
        self.queue.iter().position(|group| {
            let Some(&limit) = self.settings.project_limits.get(&group.project_id) else {
                return true;
            };
            let busy_for_project = self
                .slots
                .iter()
                .filter(|slot| {
                    slot.busy
                        && slot
                            .job
                            .as_ref()
                            .is_some_and(|job| job.controller.group().project_id == group.project_id)
                })
                .count();
            busy_for_project < limit
        })
    }

    /// Gets a ready worker into a claimed slot: reuses, replaces, or spawns one.
    fn prepare_slot(&mut self, slot: usize) {
        let Some(job) = self.slots[slot].job.as_ref() else {
            return;
        };
        let hash = job.controller.group().worker_hash.clone();

        if let Some(worker) = &self.slots[slot].worker {
            if worker.hash() != hash || worker.did_send_stop() {
                let worker = worker.clone();
                let events = self.events_tx.clone();
                debug!(slot, worker_index = worker.worker_index(), "replacing worker");
                tokio::spawn(async move {
                    worker.stop_and_wait(false).await;
                    _ = events.send(SchedulerEvent::Restarted {
                        slot,
                        old_worker: worker.worker_index(),
                    });
                });
            } else {
                self.run_job_in_worker(slot);
            }
            return;
        }

        self.spawn_worker(slot);
    }

    fn spawn_worker(&mut self, slot: usize) {
        let Some(job) = self.slots[slot].job.as_ref() else {
            return;
        };
        let group = job.controller.group();
        let worker_index = self.run.next_worker_index;
        self.run.next_worker_index += 1;

        let spec = WorkerSpec {
            worker_index,
            parallel_index: slot,
            hash: group.worker_hash.clone(),
            project_id: group.project_id.clone(),
            extra_env: self
                .extra_env
                .get(&group.project_id)
                .cloned()
                .unwrap_or_default(),
            stop_grace_period: self.settings.stop_grace_period,
        };
        let init = InitParams {
            worker_index,
            parallel_index: slot,
            repeat_each_index: group.repeat_each_index,
            project_id: group.project_id.clone(),
            artifacts_dir: self.settings.artifacts_dir.join(&group.project_id),
            config: self.settings.run_config.clone(),
        };

        let worker = match WorkerHandle::spawn(&self.settings.command, spec, self.events_tx.clone())
        {
            Ok(worker) => worker,
            Err(error) => {
                warn!(slot, error = %DisplayErrorChain::new(&error), "failed to spawn worker");
                let error = TestError::new(format!("Error: {}", DisplayErrorChain::new(&error)));
                self.fail_job_before_start(slot, error);
                return;
            }
        };
        self.worker_projects
            .insert(worker_index, worker.project_id().to_owned());
        self.live_workers.insert(worker_index);
        self.slots[slot].worker = Some(worker.clone());

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match worker.start(init).await {
                Ok(()) => Ok(()),
                Err(WorkerStartError::ExitedBeforeReady) => {
                    let exit = worker.wait_for_exit().await;
                    Err(TestError::new(exit.unexpected_message()))
                }
                Err(error) => {
                    worker.stop(true);
                    Err(TestError::new(format!(
                        "Error: {}",
                        DisplayErrorChain::new(&error)
                    )))
                }
            };
            _ = events.send(SchedulerEvent::Started {
                slot,
                worker_index,
                result,
            });
        });
    }

    /// Sends the slot's group to its worker.
    fn run_job_in_worker(&mut self, slot: usize) {
        let WorkerSlot { worker, job, .. } = &mut self.slots[slot];
        let (Some(worker), Some(job)) = (worker.as_ref(), job.as_mut()) else {
            return;
        };
        let params =
            job.controller
                .start(self.run.tree, worker.worker_index(), worker.parallel_index());
        job.state = JobState::Running;
        debug!(
            slot,
            worker_index = worker.worker_index(),
            tests = params.entries.len(),
            "running group"
        );
        worker.run_group(params);
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Worker(WorkerEnvelope {
                worker_index,
                output,
            }) => self.handle_worker_output(worker_index, output),
            SchedulerEvent::Restarted { slot, old_worker } => {
                let slot_state = &mut self.slots[slot];
                if slot_state
                    .worker
                    .as_ref()
                    .is_some_and(|worker| worker.worker_index() == old_worker)
                {
                    slot_state.worker = None;
                }
                if self.stopped {
                    self.release_slot(slot);
                    return;
                }
                self.spawn_worker(slot);
            }
            SchedulerEvent::Started {
                slot,
                worker_index,
                result,
            } => {
                if self.stopped {
                    self.release_slot(slot);
                    return;
                }
                let still_there = self.slots[slot]
                    .worker
                    .as_ref()
                    .is_some_and(|worker| worker.worker_index() == worker_index);
                match result {
                    Ok(()) if still_there => self.run_job_in_worker(slot),
                    Ok(()) => {
                        // The worker came up and exited right away.
                        let error = TestError::new(
                            "Error: worker process exited unexpectedly after it became ready",
                        );
                        self.fail_job_before_start(slot, error);
                    }
                    Err(error) => self.fail_job_before_start(slot, error),
                }
            }
        }
        self.check_max_failures();
        if std::mem::take(&mut self.slot_freed) {
            self.schedule();
        }
    }

    fn handle_worker_output(&mut self, worker_index: usize, output: WorkerOutput) {
        let slot = self.slots.iter().position(|slot| {
            slot.worker
                .as_ref()
                .is_some_and(|worker| worker.worker_index() == worker_index)
        });

        match output {
            WorkerOutput::Stdout(chunk) => self.on_output(slot, chunk, false),
            WorkerOutput::Stderr(chunk) => self.on_output(slot, chunk, true),
            WorkerOutput::Event(WorkerEvent::Stdout(params)) => {
                self.on_output(slot, chunk_from_params(params), false)
            }
            WorkerOutput::Event(WorkerEvent::Stderr(params)) => {
                self.on_output(slot, chunk_from_params(params), true)
            }
            WorkerOutput::Event(WorkerEvent::TeardownErrors(params)) => {
                self.run.failure_tracker.on_worker_error();
                for error in params.fatal_errors {
                    self.run.emitter.emit(TestEventKind::Error { error });
                }
            }
            WorkerOutput::Event(event) => {
                let Some(slot) = slot else {
                    debug!(worker_index, "ignoring event from a retired worker");
                    return;
                };
                let result = match &mut self.slots[slot].job {
                    Some(ActiveJob {
                        controller,
                        state: JobState::Running,
                    }) => controller.on_event(self.run, event),
                    _ => {
                        debug!(worker_index, "ignoring event from an idle worker");
                        None
                    }
                };
                if let Some(result) = result {
                    self.on_job_result(slot, result);
                }
            }
            WorkerOutput::Exited(exit) => {
                self.live_workers.remove(&worker_index);
                if let Some(project) = self.worker_projects.remove(&worker_index) {
                    if !exit.produced_env.is_empty() {
                        let env = self.produced_env.entry(project).or_default();
                        for (key, value) in exit.produced_env.iter().cloned() {
                            env.retain(|(existing, _)| *existing != key);
                            env.push((key, value));
                        }
                    }
                }
                let Some(slot) = slot else {
                    return;
                };
                let Some(worker) = self.slots[slot].worker.take() else {
                    return;
                };
                let result = match &mut self.slots[slot].job {
                    Some(ActiveJob {
                        controller,
                        state: JobState::Running,
                    }) => {
                        let unexpected = (!worker.did_send_stop())
                            .then(|| TestError::new(exit.unexpected_message()));
                        if unexpected.is_some() {
                            warn!(worker_index, code = ?exit.code, signal = ?exit.signal, "worker exited unexpectedly");
                        }
                        Some(controller.on_exit(self.run, unexpected))
                    }
                    _ => None,
                };
                if let Some(result) = result {
                    self.on_job_result(slot, result);
                }
            }
        }
    }

    /// Attributes output to the test the worker is running.
    ///
    /// Output from a worker that failed is kept out of results, so a later retry isn't
    /// polluted by teardown noise.
    fn on_output(&mut self, slot: Option<usize>, chunk: OutputChunk, is_stderr: bool) {
        let current = slot.and_then(|slot| {
            let slot = &self.slots[slot];
            if slot.worker.as_ref().is_some_and(WorkerHandle::did_fail) {
                return None;
            }
            match &slot.job {
                Some(ActiveJob {
                    controller,
                    state: JobState::Running,
                }) => controller.currently_running(),
                _ => None,
            }
        });

        let attempt = current.map(|(test, result)| {
            let case = self.run.tree.test_mut(test);
            let data = &mut case.results[result];
            if is_stderr {
                data.stderr.push(chunk.clone());
            } else {
                data.stdout.push(chunk.clone());
            }
            TestAttempt {
                test,
                test_id: case.id.clone(),
                retry: result,
            }
        });
        let kind = if is_stderr {
            TestEventKind::Stderr { attempt, chunk }
        } else {
            TestEventKind::Stdout { attempt, chunk }
        };
        self.run.emitter.emit(kind);
    }

    fn fail_job_before_start(&mut self, slot: usize, error: TestError) {
        let result = match self.slots[slot].job.as_mut() {
            Some(job) => job.controller.on_exit(self.run, Some(error)),
            None => {
                self.release_slot(slot);
                return;
            }
        };
        self.on_job_result(slot, result);
    }

    /// Post-run accounting for a finished job, then frees the slot.
    fn on_job_result(&mut self, slot: usize, result: JobResult) {
        let Some(job) = self.slots[slot].job.take() else {
            return;
        };
        let hash = job.controller.group().worker_hash.clone();

        if let Some(worker) = &self.slots[slot].worker {
            if result.did_fail {
                worker.stop(true);
            }
        }
        self.finish_job(slot, hash, result.new_job);
    }

    fn finish_job(&mut self, slot: usize, hash: String, new_job: Option<TestGroup>) {
        self.update_hash_count(&hash, -1);
        if let Some(worker) = &self.slots[slot].worker {
            if self.settings.retire_redundant_workers
                && !worker.did_send_stop()
                && self.is_worker_redundant(worker)
            {
                debug!(
                    worker_index = worker.worker_index(),
                    hash = worker.hash(),
                    "retiring redundant worker"
                );
                worker.stop(false);
            }
        }

        if let Some(new_job) = new_job {
            if !self.stopped {
                debug!(tests = new_job.tests.len(), "queueing retry group first");
                self.update_hash_count(&new_job.worker_hash, 1);
                self.queue.push_front(new_job);
            }
        }

        self.release_slot(slot);
    }

    fn release_slot(&mut self, slot: usize) {
        self.slots[slot].job = None;
        self.slots[slot].busy = false;
        self.slot_freed = true;
    }

    /// More live workers share this worker's hash than there is queued or running work for.
    fn is_worker_redundant(&self, worker: &WorkerHandle) -> bool {
        let same_hash = self
            .slots
            .iter()
            .filter_map(|slot| slot.worker.as_ref())
            .filter(|other| !other.did_send_stop() && other.hash() == worker.hash())
            .count();
        same_hash
            > self
                .queued_or_running
                .get(worker.hash())
                .copied()
                .unwrap_or(0)
    }

    fn update_hash_count(&mut self, hash: &str, delta: isize) {
        let count = self.queued_or_running.entry(hash.to_owned()).or_default();
        *count = count.saturating_add_signed(delta);
    }

    fn check_max_failures(&mut self) {
        if self.run.failure_tracker.has_reached_max_failures() {
            self.stop();
        }
    }
}

fn chunk_from_params(params: OutputParams) -> OutputChunk {
    match (params.text, params.buffer) {
        (Some(text), _) => OutputChunk::Text(text),
        (None, Some(buffer)) => OutputChunk::Bytes(buffer),
        (None, None) => OutputChunk::Text(String::new()),
    }
}
