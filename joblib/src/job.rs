//! One job: the supervisor side of the launch protocol, the tracked state
//! machine, and follower streaming over the job's log file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command as ChildCommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::output;
use crate::reexec::{self, Command, JobSpec};
use crate::watch::{Event, Op, Watcher};

pub type JobId = Uuid;

/// Exit code sentinel meaning "no code": the job is pending, running, or was
/// terminated by a signal.
pub const NO_EXIT: i32 = -1;

/// Lifecycle of a job. Transitions only move forward:
/// Pending → Running → (Stopped | Exited).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Copy)]
struct State {
    status: Status,
    exit_code: i32,
}

/// Both pipe pairs as (child read end, supervisor write end).
struct Pipes {
    command: (OwnedFd, OwnedFd),
    cont: (OwnedFd, OwnedFd),
}

/// A single arbitrary command and everything the supervisor tracks about it.
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub command: Command,
    pub created_at: SystemTime,

    config: Arc<Config>,
    state: RwLock<State>,
    /// Supervision scope: cancelling it kills the job's process group and
    /// unblocks every task attached to the job.
    cancel: CancellationToken,
    /// Fires once the waiter has recorded the final state and cleaned up.
    done: CancellationToken,

    exe: PathBuf,
    log_path: PathBuf,

    pipes: Mutex<Option<Pipes>>,
    continue_tx: Mutex<Option<OwnedFd>>,
    child: Mutex<Option<Child>>,
    pid: OnceLock<u32>,

    watcher: Mutex<Option<Watcher>>,
    /// One single-slot wake channel per attached follower.
    listeners: Mutex<HashMap<Uuid, mpsc::Sender<()>>>,
}

impl Job {
    /// Builds a Pending job: log file, output watcher, and both pipes exist
    /// after this; nothing is spawned until [`Job::start`].
    pub(crate) fn new(
        config: Arc<Config>,
        owner: impl Into<String>,
        command: Command,
    ) -> Result<Arc<Self>> {
        let id = Uuid::new_v4();

        // The log exists from the moment the target may produce output.
        output::create_file(&config, id)?;
        let log_path = output::file_path(&config, id);

        let (mut watcher, events) = Watcher::new()?;
        watcher.add(&log_path)?;

        // Close-on-exec on every end: the child sees the read ends only as
        // the dup2'd fds 3 and 4 installed right before exec.
        let command_pipe =
            pipe2(OFlag::O_CLOEXEC).map_err(|err| Error::io("create command pipe", err.into()))?;
        let continue_pipe =
            pipe2(OFlag::O_CLOEXEC).map_err(|err| Error::io("create continue pipe", err.into()))?;

        let exe = std::env::current_exe()
            .map_err(|err| Error::io("resolve current executable", err))?;

        let job = Arc::new(Self {
            id,
            owner: owner.into(),
            command,
            created_at: SystemTime::now(),
            config,
            state: RwLock::new(State {
                status: Status::Pending,
                exit_code: NO_EXIT,
            }),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            exe,
            log_path,
            pipes: Mutex::new(Some(Pipes {
                command: command_pipe,
                cont: continue_pipe,
            })),
            continue_tx: Mutex::new(None),
            child: Mutex::new(None),
            pid: OnceLock::new(),
            watcher: Mutex::new(Some(watcher)),
            listeners: Mutex::new(HashMap::new()),
        });

        tokio::spawn(forward_watch_events(Arc::clone(&job), events));

        info!(job = %id, "constructed new job");
        Ok(job)
    }

    /// Spawns the re-exec child in its own process group with the command
    /// pipe on fd 3 and the continue pipe on fd 4, then feeds it the JSON job
    /// descriptor from a separate task. The target command does not run until
    /// [`Job::signal_continue`].
    pub(crate) fn start(&self) -> Result<()> {
        let Some(pipes) = self.pipes.lock().unwrap().take() else {
            return Err(Error::io(
                "start job",
                io::Error::new(io::ErrorKind::Other, "job already started"),
            ));
        };
        let (cmd_read, cmd_write) = pipes.command;
        let (cont_read, cont_write) = pipes.cont;

        let payload = serde_json::to_vec(&JobSpec {
            id: self.id,
            command: self.command.clone(),
        })?;

        let mut child_cmd = ChildCommand::new(&self.exe);
        child_cmd.arg(&self.config.reexec_subcommand);
        let cmd_fd = cmd_read.as_raw_fd();
        let cont_fd = cont_read.as_raw_fd();
        unsafe {
            child_cmd.pre_exec(move || {
                // New process group so stopping the job can kill the whole
                // tree with one signal.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                install_pipe_fds(cmd_fd, cont_fd)
            });
        }

        let child = child_cmd
            .spawn()
            .map_err(|err| Error::io("spawn reexec child", err))?;
        let pid = child.id().ok_or_else(|| {
            Error::io(
                "spawn reexec child",
                io::Error::new(io::ErrorKind::Other, "child has no pid"),
            )
        })?;
        let _ = self.pid.set(pid);
        *self.child.lock().unwrap() = Some(child);
        *self.continue_tx.lock().unwrap() = Some(cont_write);

        // The supervisor's copies of the child-side ends are closed here; the
        // child keeps its own fds 3 and 4.
        drop(cmd_read);
        drop(cont_read);

        // The child reads the descriptor to EOF, so the write end must close
        // when the payload is out.
        let cancel = self.cancel.clone();
        let job_id = self.id;
        tokio::task::spawn_blocking(move || {
            let mut pipe = File::from(cmd_write);
            if let Err(err) = pipe.write_all(&payload) {
                error!(job = %job_id, error = %err, "writing job descriptor");
                cancel.cancel();
            }
        });

        debug!(job = %self.id, pid, "reexec child spawned");
        Ok(())
    }

    /// Hands execution over to the target: closing the supervisor's write end
    /// of the continue pipe is the signal.
    pub(crate) fn signal_continue(&self) {
        if self.continue_tx.lock().unwrap().take().is_some() {
            debug!(job = %self.id, "signalled continue");
        }
    }

    pub fn status(&self) -> Status {
        self.state.read().unwrap().status
    }

    pub fn exit_code(&self) -> i32 {
        self.state.read().unwrap().exit_code
    }

    pub(crate) fn set_running(&self) {
        self.state.write().unwrap().status = Status::Running;
        info!(job = %self.id, "job running");
    }

    /// Cancels the supervision scope. Idempotent.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the waiter has finished with this job.
    pub(crate) async fn finished(&self) {
        self.done.cancelled().await;
    }

    pub(crate) fn take_child(&self) -> Option<Child> {
        self.child.lock().unwrap().take()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Kills the job's process group; the kernel propagates to the target.
    pub(crate) fn kill_group(&self) {
        if let Some(pid) = self.pid() {
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(job = %self.id, pid, error = %err, "killing job process group");
            }
        }
    }

    /// Classifies how the child went away. An exit code means the target ran
    /// to completion; signal death means the job was stopped.
    pub(crate) fn record_exit(&self, exit: ExitStatus) {
        {
            let mut state = self.state.write().unwrap();
            match exit.code() {
                Some(code) => {
                    state.status = Status::Exited;
                    state.exit_code = code;
                }
                None => {
                    state.status = Status::Stopped;
                    state.exit_code = NO_EXIT;
                }
            }
            info!(job = %self.id, status = ?state.status, code = state.exit_code, "job finished");
        }
        // Followers parked at end-of-file re-check status on this wake-up.
        self.notify_listeners();
    }

    /// Releases pipes and the output watcher. Idempotent; the state machine
    /// stays wherever it is.
    pub(crate) fn cleanup(&self) {
        *self.pipes.lock().unwrap() = None;
        *self.continue_tx.lock().unwrap() = None;
        if let Some(mut watcher) = self.watcher.lock().unwrap().take() {
            if let Err(err) = watcher.remove(&self.log_path) {
                debug!(job = %self.id, error = %err, "removing output watch");
            }
        }
        self.notify_listeners();
        self.done.cancel();
    }

    fn notify_listeners(&self) {
        let listeners = self.listeners.lock().unwrap();
        for wake in listeners.values() {
            // A full slot already carries the wake-up; a closed listener is
            // about to deregister itself.
            let _ = wake.try_send(());
        }
    }

    /// Streams the job log from byte 0 into `sink` in `chunk_size` chunks.
    ///
    /// Returns when the log is exhausted and the job is no longer running;
    /// fails with [`Error::StreamCancelled`] when `token` fires or the sink
    /// closes. Every follower observes the same byte order: the log file is
    /// the single source of truth.
    pub async fn stream_output(
        &self,
        token: CancellationToken,
        sink: mpsc::Sender<Bytes>,
        chunk_size: usize,
    ) -> Result<()> {
        let mut log = tokio::fs::File::open(&self.log_path)
            .await
            .map_err(|err| {
                Error::io(format!("open job output {}", self.log_path.display()), err)
            })?;

        // Register the wake-up slot for the whole stream. Capacity one: a
        // notification racing a read parks in the slot instead of being lost,
        // and a tardy follower never blocks the broadcaster.
        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let key = Uuid::new_v4();
        self.listeners.lock().unwrap().insert(key, wake_tx);
        let _listener = ListenerGuard { job: self, key };

        loop {
            let mut buf = BytesMut::with_capacity(chunk_size);
            let n = log
                .read_buf(&mut buf)
                .await
                .map_err(|err| Error::io("read job output", err))?;

            if n > 0 {
                tokio::select! {
                    _ = token.cancelled() => return Err(Error::StreamCancelled),
                    sent = sink.send(buf.freeze()) => {
                        if sent.is_err() {
                            return Err(Error::StreamCancelled);
                        }
                    }
                }
                continue;
            }

            // End of file. Done unless the job can still produce output.
            if self.status() != Status::Running {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::StreamCancelled),
                _ = sink.closed() => return Err(Error::StreamCancelled),
                _ = wake_rx.recv() => {}
            }
        }
    }
}

/// Deregisters a follower's wake channel when its stream ends.
struct ListenerGuard<'a> {
    job: &'a Job,
    key: Uuid,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.job.listeners.lock().unwrap().remove(&self.key);
    }
}

/// Fans file events out to the job's followers. Ends when the watcher closes.
async fn forward_watch_events(job: Arc<Job>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        if event.op.contains(Op::WRITE) {
            job.notify_listeners();
        }
    }
}

/// Installs the child's pipe ends at the fixed descriptors the reexec
/// subcommand expects. Runs between fork and exec: async-signal-safe calls
/// only.
fn install_pipe_fds(cmd_fd: RawFd, mut cont_fd: RawFd) -> io::Result<()> {
    unsafe {
        // The continue fd could occupy fd 3; move it clear before the command
        // pipe is installed there.
        if cont_fd == reexec::COMMAND_PIPE_FD {
            cont_fd = libc::fcntl(cont_fd, libc::F_DUPFD_CLOEXEC, reexec::CONTINUE_PIPE_FD + 1);
            if cont_fd < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if cmd_fd != reexec::COMMAND_PIPE_FD
            && libc::dup2(cmd_fd, reexec::COMMAND_PIPE_FD) < 0
        {
            return Err(io::Error::last_os_error());
        }
        if cont_fd != reexec::CONTINUE_PIPE_FD
            && libc::dup2(cont_fd, reexec::CONTINUE_PIPE_FD) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
