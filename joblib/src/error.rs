use std::io;
use std::path::PathBuf;
use std::result;

use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("service is closing")]
    ServiceClosing,
    #[error("job {0} already started")]
    AlreadyStarted(Uuid),
    #[error("no such job: {0}")]
    NotFound(Uuid),
    #[error("job {0} is not running")]
    NotRunning(Uuid),

    #[error("mount cgroup2 on {path}: {source}")]
    Mount { path: PathBuf, source: nix::Error },
    #[error("enable {controller} controller for {path}: {source}")]
    ControllerEnable {
        controller: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("apply {control} = {value:?}: {source}")]
    ResourceLimit {
        control: &'static str,
        value: String,
        source: io::Error,
    },

    #[error("path is already being watched: {0}")]
    AlreadyWatched(PathBuf),
    #[error("path is not being watched: {0}")]
    NotWatched(PathBuf),

    #[error("inherited fd {0} missing")]
    MissingPipe(i32),
    #[error("continue pipe: expected EOF, read a byte")]
    UnexpectedContinueByte,
    #[error("continue pipe: timed out waiting for the supervisor")]
    ContinueTimeout,
    #[error("job descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("output stream cancelled")]
    StreamCancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: io::Error,
    },
}

impl Error {
    /// Attach context to an io::Error, the way most filesystem call sites
    /// here need it.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
