//! Child-process engine.
//!
//! A task is a child process spawned in a folder's directory with its
//! three standard streams piped. Stdout and stderr are pumped into a
//! per-task event queue as chunks arrive; process exit lands as the
//! queue's terminal event and in a broadcast cell, so every current and
//! future observer sees it. The hub consumes events one at a time via
//! `task.progress`.
//!
//! The caller's argv is wrapped as
//! `bash --login -c 'exec "$@"' -- <arg0> <arg1> ...`, which makes the
//! first caller-supplied argument the command while keeping login-shell
//! semantics.

use std::cell::Cell;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use bytes::Bytes;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use taskplane_core::sync::{AsyncDestroy, AsyncMap, AsyncQueue, OnceValue};
use taskplane_core::{ErrorKind, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum caller-supplied arguments; the bash trampoline and the
/// terminator take the rest of the 32-slot argv.
pub const TASK_ARGS_MAX: usize = 27;

/// Bound on ids returned by one task listing.
pub const TASK_LIST_MAX: usize = 64;

const READ_CHUNK: usize = 4 * 1024;

/// One captured process event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcEvent {
    /// A chunk read from stdout.
    Stdout(Bytes),
    /// A chunk read from stderr.
    Stderr(Bytes),
    /// Terminal exit status.
    Exit(i64),
}

/// One progress observation handed back to the dispatcher.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    /// The event being reported.
    pub event: ProcEvent,
    /// Events still queued after this one.
    pub events_left: u32,
    /// Whether this observation retired the task record.
    pub finished: bool,
}

/// State of one running (or exited, not yet reaped) task.
pub struct ProcRecord {
    task_id: u32,
    folder: String,
    events: Rc<AsyncQueue<ProcEvent>>,
    exit_status: Rc<OnceValue<i64>>,
    pid: Cell<Option<i32>>,
    readers: CancellationToken,
    spawn_failed: Cell<bool>,
}

impl ProcRecord {
    fn new(task_id: u32, folder: String) -> Self {
        Self {
            task_id,
            folder,
            events: Rc::new(AsyncQueue::new()),
            exit_status: Rc::new(OnceValue::new()),
            pid: Cell::new(None),
            readers: CancellationToken::new(),
            spawn_failed: Cell::new(false),
        }
    }

    /// Folder the task runs in.
    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Stop the streams, ask the child to terminate, and wait for its
    /// exit status. Safe to call more than once.
    async fn terminate(&self) {
        if self.spawn_failed.get() {
            return;
        }
        self.readers.cancel();
        if !self.exit_status.is_set() {
            if let Some(pid) = self.pid.get() {
                debug!("sending SIGTERM to task {} (pid {pid})", self.task_id);
                if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    // Already gone is fine; the waiter still reaps it.
                    if err != nix::errno::Errno::ESRCH {
                        warn!("SIGTERM to pid {pid} failed: {err}");
                    }
                }
            }
        }
        let status = self.exit_status.get().await;
        debug!("task {} terminated with status {status}", self.task_id);
    }
}

impl AsyncDestroy for ProcRecord {
    async fn destroy(&self) {
        self.terminate().await;
    }
}

/// Engine owning every task record of the unit.
pub struct ProcEngine {
    workdir: PathBuf,
    procs: Rc<AsyncMap<u32, ProcRecord>>,
}

impl ProcEngine {
    /// Engine rooted at the unit's work directory.
    #[must_use]
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            procs: Rc::new(AsyncMap::new()),
        }
    }

    /// Run the record map's deferred-destruction driver until cancelled.
    pub fn spawn_destroyer(&self, cancel: CancellationToken) {
        let procs = self.procs.clone();
        tokio::task::spawn_local(async move { procs.run_destroyer(cancel).await });
    }

    /// Spawn a task.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InputError`] on a duplicate id or too many
    /// arguments, [`ErrorKind::ReactorError`] when the spawn itself
    /// fails (the record is rolled back).
    pub async fn start(&self, task_id: u32, folder: &str, args: &[String]) -> Result<()> {
        if self.procs.contains_key(&task_id) {
            error!("task {task_id} already exists");
            return Err(ErrorKind::InputError);
        }
        if args.len() > TASK_ARGS_MAX {
            error!("too many args for task {task_id}: {}", args.len());
            return Err(ErrorKind::InputError);
        }
        let cwd = self.workdir.join(folder);
        info!("starting task {task_id}: {args:?} in {}", cwd.display());

        let Some(handle) = self.procs.try_insert(task_id, ProcRecord::new(task_id, folder.to_owned()))
        else {
            return Err(ErrorKind::InputError);
        };

        let mut cmd = Command::new("/bin/bash");
        cmd.arg("--login")
            .arg("-c")
            .arg(r#"exec "$@""#)
            .arg("--")
            .args(args)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!("spawn failed for task {task_id}: {err}");
                handle.spawn_failed.set(true);
                self.procs.remove(&task_id);
                return Err(ErrorKind::ReactorError);
            }
        };
        handle
            .pid
            .set(child.id().and_then(|p| i32::try_from(p).ok()));

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::task::spawn_local(pump_stream(
                stdout,
                handle.events.clone(),
                handle.readers.clone(),
                false,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::task::spawn_local(pump_stream(
                stderr,
                handle.events.clone(),
                handle.readers.clone(),
                true,
            )));
        }
        tokio::task::spawn_local(reap_child(
            task_id,
            child,
            pumps,
            handle.events.clone(),
            handle.exit_status.clone(),
        ));

        debug!("task {task_id} started");
        Ok(())
    }

    /// Observe the next event of a task.
    ///
    /// An already-observed exit short-circuits: the terminal status is
    /// reported again without consuming queued output. Reporting an exit
    /// retires the record, so a later `progress` for the same id is an
    /// input error.
    pub async fn progress(&self, task_id: u32) -> Result<ProgressReport> {
        let Some(handle) = self.procs.get(&task_id) else {
            error!("task {task_id} not found");
            return Err(ErrorKind::InputError);
        };
        debug!("task {task_id} progress requested");

        if let Some(status) = handle.exit_status.peek() {
            self.procs.remove(&task_id);
            return Ok(ProgressReport {
                event: ProcEvent::Exit(status),
                events_left: 0,
                finished: true,
            });
        }

        let event = handle.events.dequeue().await;
        let events_left = u32::try_from(handle.events.len()).unwrap_or(u32::MAX);
        let finished = matches!(event, ProcEvent::Exit(_));
        if finished {
            self.procs.remove(&task_id);
        }
        Ok(ProgressReport {
            event,
            events_left,
            finished,
        })
    }

    /// Terminate a task and retire its record.
    pub async fn cancel(&self, task_id: u32) -> Result<()> {
        let Some(handle) = self.procs.get(&task_id) else {
            error!("task {task_id} not found");
            return Err(ErrorKind::InputError);
        };
        info!("cancelling task {task_id}");
        handle.terminate().await;
        self.procs.remove(&task_id);
        Ok(())
    }

    /// Task ids in key order, starting at `offset`, at most
    /// [`TASK_LIST_MAX`].
    #[must_use]
    pub fn list(&self, offset: u32) -> Vec<u32> {
        self.procs
            .keys()
            .into_iter()
            .skip(offset as usize)
            .take(TASK_LIST_MAX)
            .collect()
    }

    /// Folder a live task runs in.
    #[must_use]
    pub fn folder_of(&self, task_id: u32) -> Option<String> {
        self.procs.get(&task_id).map(|r| r.folder().to_owned())
    }

    /// Number of live task records.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.procs.len()
    }

    /// Terminate everything and drain the record map.
    pub async fn shutdown(&self) {
        info!("shutting down tasks: {} active", self.procs.len());
        self.procs.shutdown().await;
        info!("all tasks reaped");
    }
}

async fn pump_stream<R>(
    mut stream: R,
    events: Rc<AsyncQueue<ProcEvent>>,
    cancel: CancellationToken,
    is_stderr: bool,
) where
    R: AsyncReadExt + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    debug!("captured {n} bytes of {}", if is_stderr { "stderr" } else { "stdout" });
                    events.enqueue(if is_stderr {
                        ProcEvent::Stderr(chunk)
                    } else {
                        ProcEvent::Stdout(chunk)
                    });
                }
                Err(err) => {
                    warn!("pipe read failed: {err}");
                    break;
                }
            },
        }
    }
}

async fn reap_child(
    task_id: u32,
    mut child: Child,
    pumps: Vec<tokio::task::JoinHandle<()>>,
    events: Rc<AsyncQueue<ProcEvent>>,
    exit_status: Rc<OnceValue<i64>>,
) {
    // Both streams must drain (EOF or cancel) before the exit becomes
    // observable, so no captured output can be lost behind the terminal
    // event.
    for pump in pumps {
        let _ = pump.await;
    }
    let status = match child.wait().await {
        Ok(status) => i64::from(status.code().unwrap_or(0)),
        Err(err) => {
            error!("waiting on task {task_id} failed: {err}");
            0
        }
    };
    info!("task {task_id} exited with status {status}");
    exit_status.set(status);
    events.enqueue_terminal(ProcEvent::Exit(status));
}
