//! The child side of the three-process launch protocol.
//!
//! The supervisor re-invokes its own binary with a dedicated subcommand and
//! two inherited pipes: the command pipe on fd 3 carries the JSON job
//! descriptor, the continue pipe on fd 4 is closed by the supervisor once the
//! child sits in its cgroup. Only then does the target command run, so the
//! target never executes user code outside its resource limits.
//!
//! This module runs in the child before any runtime is set up; everything
//! here is synchronous.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::process::Command as ProcessCommand;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::output;

/// Inherited descriptor carrying the job descriptor from the supervisor.
pub const COMMAND_PIPE_FD: RawFd = 3;
/// Inherited descriptor whose closure is the "continue" signal.
pub const CONTINUE_PIPE_FD: RawFd = 4;

/// Exit code reported when the child fails before the target command ran, or
/// when the target was killed by a signal.
pub const SETUP_FAILURE: i32 = 100;

/// How long the child waits for the continue signal before giving up.
const CONTINUE_TIMEOUT_MS: i32 = 10_000;

/// The target program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

/// What the supervisor pipes to the child: enough to open the right log file
/// and exec the right command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Uuid,
    pub command: Command,
}

/// Entry point of the reexec subcommand. Never returns an error; protocol and
/// setup failures are reported to the supervisor as exit code 100.
pub fn run(config: &Config) -> i32 {
    match exec(config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("jobworker reexec: {err}");
            SETUP_FAILURE
        }
    }
}

fn exec(config: &Config) -> Result<i32> {
    ensure_inherited(COMMAND_PIPE_FD)?;
    let spec = read_job_spec()?;

    // The target's combined stdout/stderr goes to the job's log file.
    let log = output::create_file(config, spec.id)?;
    let log_err = log
        .try_clone()
        .map_err(|err| Error::io("clone output log fd", err))?;

    let mut target = ProcessCommand::new(&spec.command.name);
    target.args(&spec.command.args).stdout(log).stderr(log_err);

    ensure_inherited(CONTINUE_PIPE_FD)?;
    // The supervisor closes its end once this process is in the job cgroup.
    let continue_pipe = unsafe { BorrowedFd::borrow_raw(CONTINUE_PIPE_FD) };
    wait_for_continue(continue_pipe, CONTINUE_TIMEOUT_MS)?;

    let status = target
        .status()
        .map_err(|err| Error::io(format!("run {}", spec.command.name), err))?;
    Ok(status.code().unwrap_or(SETUP_FAILURE))
}

/// The supervisor is expected to have installed `fd` before exec. Probing
/// with F_GETFD distinguishes "never set up" from a later read error.
fn ensure_inherited(fd: RawFd) -> Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(Error::MissingPipe(fd));
    }
    Ok(())
}

fn read_job_spec() -> Result<JobSpec> {
    let mut pipe = unsafe { File::from_raw_fd(COMMAND_PIPE_FD) };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .map_err(|err| Error::io("read command pipe", err))?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Blocks until the supervisor closes its end of the continue pipe (EOF).
/// An actual byte is a protocol violation and running without the signal is
/// never acceptable, so both the timeout and a byte are errors.
fn wait_for_continue(fd: BorrowedFd<'_>, timeout_ms: i32) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::io("poll continue pipe", err));
        }
        if rc == 0 {
            return Err(Error::ContinueTimeout);
        }
        break;
    }

    let mut byte = [0u8; 1];
    loop {
        let n = unsafe {
            libc::read(fd.as_raw_fd(), byte.as_mut_ptr() as *mut libc::c_void, 1)
        };
        return match n {
            0 => Ok(()),
            1 => Err(Error::UnexpectedContinueByte),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                Err(Error::io("read continue pipe", err))
            }
        };
    }
}
