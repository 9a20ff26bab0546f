//! Delegation of the blocking allocation calls to a worker process.
//!
//! A single worker process is spawned lazily on the first request, and then
//! reused for all the following ones. The requests are written to the worker
//! stdin, and the replies are read from its stdout and matched to the
//! requesters by the job identifier.
//!
//! When the worker goes away, the next request spawns a new one.
//! The jobs that were in flight at the moment the worker died are never
//! completed: their callbacks are not invoked and their futures stay pending.

use std::{
    any::Any,
    collections::HashMap,
    ffi::OsString,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
};

use crate::{
    errors::AllocationError,
    wire::{self, Reply, Request},
    Method, Scalar,
};

/// The environment variable to take the worker program path from.
pub const WORKER_ENV: &str = "PREALLOC_WORKER";

/// The file name of the worker binary, sans the platform suffix.
pub const WORKER_BIN: &str = "prealloc-worker";

/// The outcome of a job: the path on success.
pub type Outcome = Result<PathBuf, AllocationError>;

/// The handler of the job outcome.
pub type Responder = Box<dyn FnMut(Outcome) + Send>;

/// The command to spawn the worker process with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// The worker program.
    pub program: PathBuf,
    /// The arguments to pass to the worker program.
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// Run the given `program` without arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Take the worker program from the [`WORKER_ENV`] environment variable,
    /// or look for the [`WORKER_BIN`] next to the current executable, or
    /// leave it to the `PATH` lookup.
    pub fn from_env() -> Self {
        if let Some(program) = std::env::var_os(WORKER_ENV) {
            return Self::new(program);
        }

        let file_name = format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX);
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .filter(|candidate| candidate.is_file());
        Self::new(sibling.unwrap_or_else(|| file_name.into()))
    }
}

/// The table of the jobs awaiting a reply.
#[derive(Default)]
pub struct InFlight {
    /// The reply handlers by the job identifier.
    jobs: Mutex<HashMap<u64, Responder>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Responder>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the reply handler for the job.
    pub fn insert(&self, job: u64, responder: Responder) {
        self.lock().insert(job, responder);
    }

    /// Unregister the reply handler of the job.
    pub fn remove(&self, job: u64) -> Option<Responder> {
        self.lock().remove(&job)
    }

    /// The amount of the jobs in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no jobs in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Complete the job the `reply` is for.
    ///
    /// The replies to the jobs that are not in flight (already completed, or
    /// sent by a previous worker) are discarded.
    /// Returns whether the reply has matched a job.
    pub fn complete(&self, reply: Reply) -> bool {
        let Some(responder) = self.remove(reply.job) else {
            tracing::trace!(message = "discarding reply to an unknown job", job = %reply.job);
            return false;
        };
        deliver(responder, reply.into_result());
        true
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("jobs", &self.len())
            .finish()
    }
}

/// Hand the `outcome` to the `responder`.
///
/// If the responder panics, the panic is caught and delivered to the same
/// responder as an error. A second panic is dropped.
pub(crate) fn deliver(mut responder: Responder, outcome: Outcome) {
    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| responder(outcome))) else {
        return;
    };
    let err = AllocationError::local(format!(
        "callback panicked: {}",
        panic_message(payload.as_ref())
    ));
    if panic::catch_unwind(AssertUnwindSafe(|| responder(Err(err)))).is_err() {
        tracing::warn!(message = "job callback panicked twice, dropping the outcome");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// The request queued for sending to the worker.
struct Outgoing {
    request: Request,
    responder: Responder,
}

/// The handle to the running worker.
struct Worker {
    /// Distinguishes this worker from the ones spawned before and after it.
    incarnation: u64,
    /// The queue of the requests to send.
    outbox: mpsc::UnboundedSender<Outgoing>,
}

/// The state shared between the channel and the worker tasks.
#[derive(Clone, Default)]
struct Shared {
    inflight: Arc<InFlight>,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl Shared {
    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the worker handle, unless it has already been replaced.
    fn forget(&self, incarnation: u64) {
        let mut worker = self.worker();
        if worker
            .as_ref()
            .map_or(false, |worker| worker.incarnation == incarnation)
        {
            *worker = None;
        }
    }
}

/// The delegation channel.
///
/// Must be used from within a tokio runtime, and the runtime must outlive
/// the jobs scheduled through the channel.
pub struct Channel {
    /// How to spawn the worker.
    command: WorkerCommand,
    /// The last job identifier issued.
    jobs: AtomicU64,
    /// The last worker incarnation spawned.
    incarnations: AtomicU64,
    shared: Shared,
}

impl Channel {
    /// Create a new channel.
    /// The worker is not spawned until the first request is made.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            jobs: AtomicU64::new(0),
            incarnations: AtomicU64::new(0),
            shared: Shared::default(),
        }
    }

    /// The command the worker is spawned with.
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// The jobs awaiting a reply.
    pub fn inflight(&self) -> &InFlight {
        &self.shared.inflight
    }

    /// Whether a worker is attached to the channel.
    ///
    /// Turns `false` once the worker exits, until the next request spawns
    /// another one.
    pub fn is_running(&self) -> bool {
        self.shared.worker().is_some()
    }

    /// Schedule the allocation, and deliver the outcome to the `callback`.
    ///
    /// The failures to hand the request over to the worker are delivered
    /// right away, before this returns.
    pub fn schedule_with<F>(
        &self,
        method: Method,
        path: impl Into<PathBuf>,
        offset: impl Into<Scalar>,
        length: impl Into<Scalar>,
        mode: Option<Scalar>,
        callback: F,
    ) where
        F: FnMut(Outcome) + Send + 'static,
    {
        let job = self.jobs.fetch_add(1, Ordering::Relaxed) + 1;
        let request = Request {
            job,
            method,
            path: path.into(),
            offset: offset.into(),
            length: length.into(),
            mode,
        };
        self.submit(Outgoing {
            request,
            responder: Box::new(callback),
        });
    }

    /// Schedule the allocation and wait for the outcome.
    pub async fn schedule(
        &self,
        method: Method,
        path: impl Into<PathBuf>,
        offset: impl Into<Scalar>,
        length: impl Into<Scalar>,
        mode: Option<Scalar>,
    ) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.schedule_with(method, path, offset, length, mode, move |outcome| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(outcome);
            }
        });
        rx.await
            .unwrap_or_else(|_| Err(AllocationError::transport(channel_closed())))
    }

    fn submit(&self, outgoing: Outgoing) {
        let Err(outgoing) = self.enqueue(outgoing) else {
            return;
        };
        // The handle can outlive its writer, like when the runtime that ran
        // the worker tasks is gone. The stale handle is forgotten by now, so
        // the second attempt goes to a fresh worker.
        if let Err(outgoing) = self.enqueue(outgoing) {
            deliver(
                outgoing.responder,
                Err(AllocationError::transport(channel_closed())),
            );
        }
    }

    /// Queue the request to the current worker.
    ///
    /// A spawn failure is delivered right away. A closed queue forgets the
    /// worker and hands the request back.
    fn enqueue(&self, outgoing: Outgoing) -> Result<(), Outgoing> {
        let (incarnation, outbox) = match self.outbox() {
            Ok(val) => val,
            Err(err) => {
                deliver(outgoing.responder, Err(AllocationError::transport(err)));
                return Ok(());
            }
        };

        outbox
            .send(outgoing)
            .map_err(|mpsc::error::SendError(outgoing)| {
                tracing::debug!(
                    message = "unable to queue the request",
                    job = %outgoing.request.job,
                    %incarnation,
                );
                self.shared.forget(incarnation);
                outgoing
            })
    }

    /// Get the queue of the current worker, spawning it if needed.
    fn outbox(&self) -> io::Result<(u64, mpsc::UnboundedSender<Outgoing>)> {
        let mut worker = self.shared.worker();
        if let Some(worker) = worker.as_ref() {
            return Ok((worker.incarnation, worker.outbox.clone()));
        }
        let spawned = self.spawn()?;
        let val = (spawned.incarnation, spawned.outbox.clone());
        *worker = Some(spawned);
        Ok(val)
    }

    fn spawn(&self) -> io::Result<Worker> {
        let incarnation = self.incarnations.fetch_add(1, Ordering::Relaxed) + 1;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdout is closed"))?;
        tracing::debug!(message = "spawned worker", %incarnation, pid = ?child.id());

        let (outbox, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(stdin, queue, self.shared.clone(), incarnation));
        tokio::spawn(read_loop(stdout, self.shared.clone(), incarnation));
        tokio::spawn(wait_loop(child, self.shared.clone(), incarnation));

        Ok(Worker {
            incarnation,
            outbox,
        })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("command", &self.command)
            .field("jobs", &self.jobs)
            .field("inflight", &self.shared.inflight)
            .finish_non_exhaustive()
    }
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker channel is closed")
}

/// Send the queued requests to the worker.
///
/// A request is registered as in flight right before it is written. If the
/// write fails, it is unregistered and failed, and so are all the requests
/// queued after it.
async fn write_loop(
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    shared: Shared,
    incarnation: u64,
) {
    while let Some(Outgoing { request, responder }) = queue.recv().await {
        let job = request.job;
        let line = match wire::encode(&request) {
            Ok(line) => line,
            Err(err) => {
                deliver(responder, Err(AllocationError::transport(err.into())));
                continue;
            }
        };

        shared.inflight.insert(job, responder);
        if let Err(err) = write_line(&mut stdin, &line).await {
            tracing::debug!(message = "unable to send a request to the worker", %job, error = %err);
            if let Some(responder) = shared.inflight.remove(job) {
                deliver(responder, Err(AllocationError::transport(err)));
            }
            break;
        }
    }

    shared.forget(incarnation);
    queue.close();
    while let Some(Outgoing { responder, .. }) = queue.recv().await {
        deliver(responder, Err(AllocationError::transport(channel_closed())));
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

/// Read the replies from the worker and complete the matching jobs.
async fn read_loop(stdout: ChildStdout, shared: Shared, incarnation: u64) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<Reply>(&line) {
                Ok(reply) => {
                    shared.inflight.complete(reply);
                }
                Err(err) => {
                    tracing::debug!(message = "ignoring malformed reply", error = %err);
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(message = "unable to read from the worker", error = %err);
                break;
            }
        }
    }

    shared.forget(incarnation);
    let orphaned = shared.inflight.len();
    if orphaned > 0 {
        tracing::warn!(
            message = "worker is gone with jobs in flight, they will never complete",
            %incarnation,
            %orphaned,
        );
    }
}

/// Reap the worker process.
async fn wait_loop(mut child: Child, shared: Shared, incarnation: u64) {
    match child.wait().await {
        Ok(status) => tracing::debug!(message = "worker exited", %incarnation, %status),
        Err(err) => {
            tracing::debug!(message = "unable to wait for the worker", %incarnation, error = %err)
        }
    }
    shared.forget(incarnation);
}

static GLOBAL: OnceCell<Channel> = OnceCell::new();

/// Set the command for the process-wide channel.
///
/// Only effective before the process-wide channel is first used, otherwise
/// the `command` is handed back.
pub fn configure(command: WorkerCommand) -> Result<(), WorkerCommand> {
    GLOBAL
        .set(Channel::new(command))
        .map_err(|channel| channel.command)
}

/// The process-wide channel.
///
/// Configured via [`configure`], or [`WorkerCommand::from_env`] otherwise.
pub fn global() -> &'static Channel {
    GLOBAL.get_or_init(|| Channel::new(WorkerCommand::from_env()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc as std_mpsc;

    fn recorder() -> (Responder, std_mpsc::Receiver<Outcome>) {
        let (tx, rx) = std_mpsc::channel();
        let responder = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (responder, rx)
    }

    #[test]
    fn unknown_job_is_discarded() {
        let inflight = InFlight::default();
        let (responder, rx) = recorder();
        inflight.insert(1, responder);

        assert!(!inflight.complete(Reply::success(2, "f".into())));

        assert_eq!(inflight.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completes_once() {
        let inflight = InFlight::default();
        let (responder, rx) = recorder();
        inflight.insert(1, responder);

        assert!(inflight.complete(Reply::success(1, "f".into())));
        assert!(!inflight.complete(Reply::success(1, "f".into())));

        assert!(inflight.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap(), PathBuf::from("f"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_reply() {
        let inflight = InFlight::default();
        let (responder, rx) = recorder();
        inflight.insert(4, responder);

        let err = AllocationError::local("Invalid offset");
        inflight.complete(Reply::failure(4, "f".into(), &err));

        assert_eq!(rx.try_recv().unwrap().unwrap_err(), err);
    }

    #[test]
    fn panicking_callback_gets_the_panic() {
        let (tx, rx) = std_mpsc::channel();
        let mut calls = 0;
        let responder: Responder = Box::new(move |outcome: Outcome| {
            calls += 1;
            if calls == 1 {
                panic!("callback failure");
            }
            let _ = tx.send(outcome);
        });

        deliver(responder, Ok("f".into()));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.errno, -1);
        assert_eq!(err.message, "callback panicked: callback failure");
    }

    #[test]
    fn callback_panicking_twice_is_dropped() {
        let responder: Responder = Box::new(|_| panic!("always"));
        deliver(responder, Ok("f".into()));
    }

    #[test]
    fn configure_after_use_hands_the_command_back() {
        let _ = global();
        let command = WorkerCommand::new("/nonexistent/worker");
        assert_eq!(configure(command.clone()), Err(command));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_is_delivered() {
        let channel = Channel::new(WorkerCommand::new("/nonexistent/prealloc-worker"));

        let err = channel
            .schedule(Method::Fallocate, "f", 0, 1, None)
            .await
            .unwrap_err();

        assert_eq!(err.code, "ENOENT");
        assert!(channel.inflight().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_handle_is_replaced() {
        let channel = Channel::new(WorkerCommand::new("/nonexistent/prealloc-worker"));
        let (outbox, queue) = mpsc::unbounded_channel();
        drop(queue);
        *channel.shared.worker() = Some(Worker {
            incarnation: 7,
            outbox,
        });
        assert!(channel.is_running());

        let err = channel
            .schedule(Method::Fallocate, "f", 0, 1, None)
            .await
            .unwrap_err();

        // Not "channel is closed": the retry went on to spawn a new worker.
        assert_eq!(err.code, "ENOENT");
        assert!(!channel.is_running());
        assert!(channel.inflight().is_empty());
    }

    #[tokio::test]
    async fn job_ids_keep_growing() {
        let channel = Channel::new(WorkerCommand::new("/nonexistent/prealloc-worker"));
        for _ in 0..3 {
            let _ = channel.schedule(Method::Fallocate, "f", 0, 1, None).await;
        }
        assert_eq!(channel.jobs.load(Ordering::Relaxed), 3);
    }
}
