// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller side of a worker process.
//!
//! Each worker is serviced by four tasks:
//!
//! * a writer that serializes [`ControllerMessage`]s onto the worker's standard input
//! * a reader for standard output, which decodes protocol messages and forwards everything else
//!   as raw output
//! * a reader for standard error
//! * a driver that waits for the process to exit (or kills it), then publishes
//!   [`WorkerOutput::Exited`] once both readers are drained
//!
//! Everything the worker produces is sent as a [`WorkerEnvelope`] to a single channel owned by
//! the scheduler, so all state transitions happen on one task.

use super::{WorkerCommand, os};
use crate::{
    errors::{WorkerCallError, WorkerSpawnError, WorkerStartError},
    tree::OutputChunk,
};
use std::{
    collections::HashMap,
    process::ExitStatus,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use testrelay_metadata::protocol::{
    ControllerMessage, InitParams, RunGroupParams, WorkerEvent, WorkerMessage, WorkerNotification,
    WorkerRequest,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{
        Notify,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot, watch,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// How long to wait for the output readers once the worker process has exited.
///
/// A process spawned by the worker can inherit the pipes and keep them open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to spawn a worker for.
#[derive(Clone, Debug)]
pub(crate) struct WorkerSpec {
    pub(crate) worker_index: usize,
    pub(crate) parallel_index: usize,
    pub(crate) hash: String,
    pub(crate) project_id: String,
    pub(crate) extra_env: Vec<(String, Option<String>)>,
    pub(crate) stop_grace_period: Duration,
}

/// Output from a worker, tagged with the worker it came from.
#[derive(Debug)]
pub(crate) struct WorkerEnvelope {
    pub(crate) worker_index: usize,
    pub(crate) output: WorkerOutput,
}

#[derive(Debug)]
pub(crate) enum WorkerOutput {
    /// A protocol event. [`WorkerEvent::EnvProduced`] is never forwarded: it is carried by
    /// [`WorkerExit`] instead.
    Event(WorkerEvent),

    /// Raw standard output: anything that wasn't a protocol message.
    Stdout(OutputChunk),

    /// Raw standard error.
    Stderr(OutputChunk),

    /// The worker process exited. Always the last output for a worker.
    Exited(WorkerExit),
}

/// How a worker process exited.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct WorkerExit {
    pub(crate) code: Option<i32>,
    pub(crate) signal: Option<i32>,
    pub(crate) produced_env: Vec<(String, Option<String>)>,
}

impl WorkerExit {
    fn new(status: std::io::Result<ExitStatus>, produced_env: Vec<(String, Option<String>)>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: os::exit_signal(&status),
                produced_env,
            },
            Err(error) => {
                warn!(%error, "error waiting for worker process");
                Self {
                    code: None,
                    signal: None,
                    produced_env,
                }
            }
        }
    }

    /// The message used when the exit wasn't requested.
    pub(crate) fn unexpected_message(&self) -> String {
        fn or_null(value: Option<i32>) -> String {
            value.map_or_else(|| "null".to_owned(), |value| value.to_string())
        }
        format!(
            "Error: worker process exited unexpectedly (code={}, signal={})",
            or_null(self.code),
            or_null(self.signal),
        )
    }
}

/// A handle to a running worker process. Cloning the handle shares the worker.
///
/// The worker's standard input stays open for as long as any handle exists.
#[derive(Clone, Debug)]
pub(crate) struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

#[derive(Debug)]
struct WorkerInner {
    worker_index: usize,
    parallel_index: usize,
    hash: String,
    project_id: String,
    stop_grace_period: Duration,
    commands: UnboundedSender<ControllerMessage>,
    shared: Arc<WorkerShared>,
    next_call_id: AtomicU64,
    did_send_stop: AtomicBool,
    did_fail: AtomicBool,
    ready: watch::Receiver<bool>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

/// State shared with the reader and driver tasks.
#[derive(Debug, Default)]
struct WorkerShared {
    calls: Mutex<PendingCalls>,
    produced_env: Mutex<Vec<(String, Option<String>)>>,
    kill: Notify,
}

type CallResult = Result<serde_json::Value, WorkerCallError>;

#[derive(Debug, Default)]
struct PendingCalls {
    closed: bool,
    calls: HashMap<u64, oneshot::Sender<CallResult>>,
}

impl WorkerShared {
    fn calls(&self) -> MutexGuard<'_, PendingCalls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a call. Returns false if the worker has already exited.
    fn register_call(&self, id: u64, sender: oneshot::Sender<CallResult>) -> bool {
        let mut calls = self.calls();
        if calls.closed {
            return false;
        }
        calls.calls.insert(id, sender);
        true
    }

    fn resolve_call(&self, id: u64, result: CallResult) {
        match self.calls().calls.remove(&id) {
            Some(sender) => {
                // The caller may have gone away.
                _ = sender.send(result);
            }
            None => debug!(id, "worker responded to unknown call"),
        }
    }

    /// Fails every outstanding call, and every later one.
    fn close_calls(&self) {
        let mut calls = self.calls();
        calls.closed = true;
        for (_, sender) in calls.calls.drain() {
            _ = sender.send(Err(WorkerCallError::Exited));
        }
    }

    fn set_produced_env(&self, env: Vec<(String, Option<String>)>) {
        *self.produced_env.lock().unwrap_or_else(PoisonError::into_inner) = env;
    }

    fn take_produced_env(&self) -> Vec<(String, Option<String>)> {
        std::mem::take(&mut *self.produced_env.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug)]
struct OutputSink<E> {
    worker_index: usize,
    events: UnboundedSender<E>,
}

impl<E> Clone for OutputSink<E> {
    fn clone(&self) -> Self {
        Self {
            worker_index: self.worker_index,
            events: self.events.clone(),
        }
    }
}

impl<E: From<WorkerEnvelope>> OutputSink<E> {
    fn send(&self, output: WorkerOutput) {
        // The receiver is gone once the run is over, at which point output is discarded.
        _ = self.events.send(E::from(WorkerEnvelope {
            worker_index: self.worker_index,
            output,
        }));
    }
}

impl WorkerHandle {
    /// Spawns a worker process. Must be called from within a Tokio runtime.
    ///
    /// Output is delivered to `events`, ending with [`WorkerOutput::Exited`].
    pub(crate) fn spawn<E>(
        command: &WorkerCommand,
        spec: WorkerSpec,
        events: UnboundedSender<E>,
    ) -> Result<Self, WorkerSpawnError>
    where
        E: From<WorkerEnvelope> + Send + 'static,
    {
        let mut child = command
            .to_command(spec.worker_index, spec.parallel_index, &spec.extra_env)
            .spawn()
            .map_err(|error| WorkerSpawnError::new(command.program(), error))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(WorkerSpawnError::new(
                command.program(),
                std::io::Error::other("worker standard streams were not captured"),
            ));
        };
        debug!(
            worker_index = spec.worker_index,
            parallel_index = spec.parallel_index,
            pid = child.id(),
            hash = %spec.hash,
            "spawned worker"
        );

        let shared = Arc::new(WorkerShared::default());
        let sink = OutputSink {
            worker_index: spec.worker_index,
            events,
        };
        let (commands_tx, commands_rx) = unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(write_commands(stdin, commands_rx, spec.worker_index));
        let readers = [
            tokio::spawn(read_stdout(stdout, sink.clone(), shared.clone(), ready_tx)),
            tokio::spawn(read_stderr(stderr, sink.clone())),
        ];
        tokio::spawn(drive(child, readers, sink, shared.clone(), exit_tx));

        Ok(Self {
            inner: Arc::new(WorkerInner {
                worker_index: spec.worker_index,
                parallel_index: spec.parallel_index,
                hash: spec.hash,
                project_id: spec.project_id,
                stop_grace_period: spec.stop_grace_period,
                commands: commands_tx,
                shared,
                next_call_id: AtomicU64::new(1),
                did_send_stop: AtomicBool::new(false),
                did_fail: AtomicBool::new(false),
                ready: ready_rx,
                exit: exit_rx,
            }),
        })
    }

    pub(crate) fn worker_index(&self) -> usize {
        self.inner.worker_index
    }

    pub(crate) fn parallel_index(&self) -> usize {
        self.inner.parallel_index
    }

    pub(crate) fn hash(&self) -> &str {
        &self.inner.hash
    }

    pub(crate) fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// Whether the controller asked this worker to stop.
    pub(crate) fn did_send_stop(&self) -> bool {
        self.inner.did_send_stop.load(Ordering::SeqCst)
    }

    /// Whether the worker was stopped because of a failure.
    pub(crate) fn did_fail(&self) -> bool {
        self.inner.did_fail.load(Ordering::SeqCst)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }

    /// Waits for the worker to report that it is ready, then initializes it.
    pub(crate) async fn start(&self, init: InitParams) -> Result<(), WorkerStartError> {
        let mut ready = self.inner.ready.clone();
        let mut exit = self.inner.exit.clone();
        let is_ready = tokio::select! {
            biased;
            is_ready = wait_ready(&mut ready) => is_ready,
            () = wait_exited(&mut exit) => false,
        };
        if !is_ready {
            return Err(WorkerStartError::ExitedBeforeReady);
        }

        self.call(WorkerRequest::Init(init))
            .await
            .map_err(WorkerStartError::Init)?;
        debug!(worker_index = self.worker_index(), "worker initialized");
        Ok(())
    }

    /// Sends a request and waits for the correlated response.
    pub(crate) async fn call(&self, request: WorkerRequest) -> CallResult {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        if !self.inner.shared.register_call(id, sender) {
            return Err(WorkerCallError::Exited);
        }
        if self
            .inner
            .commands
            .send(ControllerMessage::Call { id, request })
            .is_err()
        {
            self.inner
                .shared
                .resolve_call(id, Err(WorkerCallError::Exited));
        }
        receiver.await.unwrap_or(Err(WorkerCallError::Exited))
    }

    pub(crate) fn notify(&self, notification: WorkerNotification) {
        if self
            .inner
            .commands
            .send(ControllerMessage::Notify { notification })
            .is_err()
        {
            debug!(
                worker_index = self.worker_index(),
                "dropping notification: worker input is closed"
            );
        }
    }

    pub(crate) fn run_group(&self, params: RunGroupParams) {
        self.notify(WorkerNotification::RunGroup(params));
    }

    /// Asks the worker to stop. Idempotent.
    ///
    /// If the worker is still running after the stop grace period, it is killed.
    pub(crate) fn stop(&self, did_fail: bool) {
        if did_fail {
            self.inner.did_fail.store(true, Ordering::SeqCst);
        }
        if self.inner.did_send_stop.swap(true, Ordering::SeqCst) || self.has_exited() {
            return;
        }

        debug!(worker_index = self.worker_index(), did_fail, "stopping worker");
        self.notify(WorkerNotification::Stop);

        let worker_index = self.worker_index();
        let grace = self.inner.stop_grace_period;
        let shared = self.inner.shared.clone();
        let mut exit = self.inner.exit.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_exited(&mut exit) => {}
                () = tokio::time::sleep(grace) => {
                    warn!(
                        worker_index,
                        "worker did not exit within {grace:?} of being stopped, killing it"
                    );
                    shared.kill.notify_one();
                }
            }
        });
    }

    /// Waits for the worker process to exit.
    pub(crate) async fn wait_for_exit(&self) -> WorkerExit {
        let mut exit = self.inner.exit.clone();
        // The driver task only goes away without publishing at runtime shutdown.
        exit.wait_for(Option::is_some)
            .await
            .map(|exit| exit.clone())
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Stops the worker and waits for it to exit.
    pub(crate) async fn stop_and_wait(&self, did_fail: bool) -> WorkerExit {
        self.stop(did_fail);
        self.wait_for_exit().await
    }
}

async fn wait_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

async fn wait_exited(exit: &mut watch::Receiver<Option<WorkerExit>>) {
    // An error means the driver is gone, which also counts as exited.
    _ = exit.wait_for(Option::is_some).await.map(|_| ());
}

async fn write_commands(
    mut stdin: ChildStdin,
    mut commands: UnboundedReceiver<ControllerMessage>,
    worker_index: usize,
) {
    while let Some(message) = commands.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(error) => {
                warn!(worker_index, %error, "failed to serialize message for worker");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(error) = stdin.write_all(&line).await {
            debug!(worker_index, %error, "worker standard input closed");
            break;
        }
        _ = stdin.flush().await;
    }
    // Dropping stdin closes it, which tells an idle worker to exit.
}

async fn read_stdout<E>(
    stdout: ChildStdout,
    sink: OutputSink<E>,
    shared: Arc<WorkerShared>,
    ready: watch::Sender<bool>,
) where
    E: From<WorkerEnvelope>,
{
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(worker_index = sink.worker_index, %error, "error reading worker stdout");
                break;
            }
        }

        match parse_message(&line) {
            Some(WorkerMessage::Ready) => {
                ready.send_replace(true);
            }
            Some(WorkerMessage::Response { id, result, error }) => {
                let result = match error {
                    Some(error) => Err(WorkerCallError::Rejected(error)),
                    None => Ok(result.unwrap_or_default()),
                };
                shared.resolve_call(id, result);
            }
            Some(WorkerMessage::Event {
                event: WorkerEvent::EnvProduced(params),
            }) => shared.set_produced_env(params.env),
            Some(WorkerMessage::Event { event }) => sink.send(WorkerOutput::Event(event)),
            None => sink.send(WorkerOutput::Stdout(chunk_from_bytes(line.clone()))),
        }
    }
}

async fn read_stderr<E>(mut stderr: ChildStderr, sink: OutputSink<E>)
where
    E: From<WorkerEnvelope>,
{
    let mut buf = vec![0; 8 * 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.send(WorkerOutput::Stderr(chunk_from_bytes(buf[..n].to_vec()))),
            Err(error) => {
                debug!(worker_index = sink.worker_index, %error, "error reading worker stderr");
                break;
            }
        }
    }
}

async fn drive<E>(
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    sink: OutputSink<E>,
    shared: Arc<WorkerShared>,
    exit: watch::Sender<Option<WorkerExit>>,
) where
    E: From<WorkerEnvelope>,
{
    let worker_index = sink.worker_index;
    let status = tokio::select! {
        status = child.wait() => status,
        () = shared.kill.notified() => {
            info!(worker_index, "killing worker");
            os::kill_worker(&mut child);
            child.wait().await
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(worker_index, "worker output still open after exit, abandoning it");
            abort.abort();
        }
    }

    shared.close_calls();
    let worker_exit = WorkerExit::new(status, shared.take_produced_env());
    debug!(
        worker_index,
        code = ?worker_exit.code,
        signal = ?worker_exit.signal,
        "worker exited"
    );
    exit.send_replace(Some(worker_exit.clone()));
    sink.send(WorkerOutput::Exited(worker_exit));
}

/// Decodes a line of worker stdout as a protocol message.
fn parse_message(line: &[u8]) -> Option<WorkerMessage> {
    let line = line.trim_ascii();
    if !line.starts_with(b"{") {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(message) => Some(message),
        Err(error) => {
            debug!(%error, "line looks like JSON but is not a protocol message");
            None
        }
    }
}

fn chunk_from_bytes(bytes: Vec<u8>) -> OutputChunk {
    String::from_utf8(bytes).map_or_else(
        |error| OutputChunk::Bytes(error.into_bytes()),
        OutputChunk::Text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use testrelay_metadata::protocol::DoneParams;

    #[test]
    fn parse_lines() {
        assert_eq!(parse_message(b"{\"kind\":\"ready\"}\n"), Some(WorkerMessage::Ready));
        assert_eq!(
            parse_message(b"{\"kind\":\"event\",\"event\":{\"method\":\"done\",\"params\":{}}}"),
            Some(WorkerMessage::Event {
                event: WorkerEvent::Done(DoneParams::default()),
            }),
        );
        assert_eq!(parse_message(b"hello world\n"), None);
        assert_eq!(parse_message(b"{\"not\": \"a message\"}\n"), None);
        assert_eq!(parse_message(b"{ broken\n"), None);
    }

    #[test]
    fn chunks() {
        assert_eq!(
            chunk_from_bytes(b"text\n".to_vec()),
            OutputChunk::Text("text\n".to_owned())
        );
        assert_eq!(
            chunk_from_bytes(vec![0xff, 0xfe]),
            OutputChunk::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test]
    fn unexpected_exit_message() {
        let exit = WorkerExit {
            code: Some(42),
            signal: None,
            produced_env: Vec::new(),
        };
        assert_eq!(
            exit.unexpected_message(),
            "Error: worker process exited unexpectedly (code=42, signal=null)"
        );
    }

    #[test]
    fn calls_fail_after_close() {
        let shared = WorkerShared::default();
        let (sender, mut receiver) = oneshot::channel();
        assert!(shared.register_call(1, sender));
        shared.close_calls();
        assert_eq!(receiver.try_recv().unwrap(), Err(WorkerCallError::Exited));

        let (sender, _receiver) = oneshot::channel();
        assert!(!shared.register_call(2, sender), "closed calls reject new ones");
    }
}
