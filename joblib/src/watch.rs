//! Kernel file-modification notifications, used to tail job output without
//! polling.
//!
//! A `Watcher` owns one inotify instance. Registered paths are tracked in a
//! pair of maps kept in sync with the kernel's view; a `DELETE_SELF` event
//! purges its path from both so user space never references a dead watch.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use inotify::{EventMask, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

/// The set of operations observed on a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op(u8);

impl Op {
    pub const CREATE: Op = Op(1);
    pub const WRITE: Op = Op(1 << 1);

    const NONE: Op = Op(0);

    pub fn contains(self, other: Op) -> bool {
        self.0 & other.0 == other.0
    }

    fn is_empty(self) -> bool {
        self == Self::NONE
    }
}

impl BitOr for Op {
    type Output = Op;

    fn bitor(self, rhs: Op) -> Op {
        Op(self.0 | rhs.0)
    }
}

impl BitOrAssign for Op {
    fn bitor_assign(&mut self, rhs: Op) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Op::CREATE) {
            names.push("CREATE");
        }
        if self.contains(Op::WRITE) {
            names.push("WRITE");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// One observed filesystem event on a watched path.
#[derive(Debug, Clone)]
pub struct Event {
    pub wd: WatchDescriptor,
    pub path: PathBuf,
    pub op: Op,
}

#[derive(Default)]
struct WatchState {
    watches: HashMap<PathBuf, WatchDescriptor>,
    paths: HashMap<WatchDescriptor, PathBuf>,
}

/// Watches filesystem paths for modifications and publishes [`Event`]s on the
/// channel returned by [`Watcher::new`].
pub struct Watcher {
    watches: Watches,
    state: Arc<Mutex<WatchState>>,
    shutdown: CancellationToken,
}

impl Watcher {
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let inotify = Inotify::init().map_err(|err| Error::io("init inotify", err))?;
        let watches = inotify.watches();
        let stream = inotify
            .into_event_stream(vec![0u8; 4096])
            .map_err(|err| Error::io("inotify event stream", err))?;

        let state = Arc::new(Mutex::new(WatchState::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(read_events(
            stream,
            Arc::clone(&state),
            events_tx,
            shutdown.clone(),
        ));

        Ok((
            Self {
                watches,
                state,
                shutdown,
            },
            events_rx,
        ))
    }

    /// Registers interest in modifications of `path`.
    pub fn add(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.watches.contains_key(path) {
            return Err(Error::AlreadyWatched(path.to_path_buf()));
        }

        let wd = self
            .watches
            .add(
                path,
                WatchMask::CREATE | WatchMask::MODIFY | WatchMask::DELETE_SELF,
            )
            .map_err(|err| Error::io(format!("add watch {}", path.display()), err))?;

        state.watches.insert(path.to_path_buf(), wd.clone());
        state.paths.insert(wd, path.to_path_buf());
        Ok(())
    }

    /// Deregisters `path`.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(wd) = state.watches.remove(path) else {
            return Err(Error::NotWatched(path.to_path_buf()));
        };
        state.paths.remove(&wd);

        self.watches
            .remove(wd)
            .map_err(|err| Error::io(format!("remove watch {}", path.display()), err))
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_events(
    mut stream: EventStream<Vec<u8>>,
    state: Arc<Mutex<WatchState>>,
    events: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            maybe = stream.next() => match maybe {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    warn!(error = %err, "reading inotify event");
                    continue;
                }
                None => return,
            },
        };

        let path = {
            let mut state = state.lock().unwrap();
            let path = state.paths.get(&event.wd).cloned();
            // The kernel dropped the watch; drop it from the maps too or they
            // no longer reflect inotify state.
            if event.mask.contains(EventMask::DELETE_SELF) {
                if let Some(path) = &path {
                    state.watches.remove(path);
                }
                state.paths.remove(&event.wd);
            }
            path
        };
        let Some(path) = path else { continue };

        let mut op = Op::NONE;
        if event.mask.contains(EventMask::CREATE) {
            op |= Op::CREATE;
        }
        if event.mask.contains(EventMask::MODIFY) {
            op |= Op::WRITE;
        }
        if op.is_empty() {
            continue;
        }

        if events
            .send(Event {
                wd: event.wd.clone(),
                path,
                op,
            })
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn add_and_remove_watch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("watched.log");
        std::fs::write(&file, b"").expect("touch");

        let (mut watcher, _events) = Watcher::new().expect("watcher");
        watcher.add(&file).expect("add");
        assert!(matches!(
            watcher.add(&file),
            Err(Error::AlreadyWatched(path)) if path == file
        ));

        watcher.remove(&file).expect("remove");
        assert!(matches!(
            watcher.remove(&file),
            Err(Error::NotWatched(path)) if path == file
        ));
    }

    #[tokio::test]
    async fn write_produces_write_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("watched.log");
        std::fs::write(&file, b"").expect("touch");

        let (mut watcher, mut events) = Watcher::new().expect("watcher");
        watcher.add(&file).expect("add");

        std::fs::write(&file, b"new bytes").expect("write");

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed");
        assert_eq!(event.path, file);
        assert!(event.op.contains(Op::WRITE));
    }

    #[tokio::test]
    async fn delete_self_purges_watch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("watched.log");
        std::fs::write(&file, b"").expect("touch");

        let (mut watcher, _events) = Watcher::new().expect("watcher");
        watcher.add(&file).expect("add");

        std::fs::remove_file(&file).expect("unlink");

        // The purge happens when the event task observes DELETE_SELF; give it
        // a moment before asserting.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(
            watcher.remove(&file),
            Err(Error::NotWatched(path)) if path == file
        ));
    }

    #[test]
    fn op_display() {
        assert_eq!((Op::CREATE | Op::WRITE).to_string(), "CREATE|WRITE");
        assert_eq!(Op::WRITE.to_string(), "WRITE");
    }
}
