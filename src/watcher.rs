//! inotify watch on the session file and its directory, plus the debouncer
//! that turns raw events into "file may have changed" signals.

use crate::error::WatchError;
use futures::StreamExt;
use inotify::{EventMask, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    Created,
    Modified,
    Removed,
    /// The kernel queue overflowed, events were lost.
    Overflow,
}

/// One debounced "the file may have changed" notification.
#[derive(Debug, Clone, Copy)]
pub struct Signal {
    /// Raw events folded into this signal.
    pub events: usize,
    pub first_at: Instant,
}

pub type RawItem = Result<RawEvent, WatchError>;

#[derive(Debug, Clone, Copy)]
struct Burst {
    first_at: Instant,
    events: usize,
}

/// Collapses bursts of raw events. The quiet window starts at the first
/// event of a burst, so a steady stream of writes still yields a signal per
/// window.
///
/// `next` is cancel safe: an open burst survives a dropped call.
pub struct Debouncer {
    rx: mpsc::Receiver<RawItem>,
    window: Duration,
    burst: Option<Burst>,
    deferred: Option<WatchError>,
}

impl Debouncer {
    pub fn channel(window: Duration) -> (mpsc::Sender<RawItem>, Self) {
        let (tx, rx) = mpsc::channel(64);
        let debouncer = Self {
            rx,
            window,
            burst: None,
            deferred: None,
        };
        (tx, debouncer)
    }

    /// `None` once the raw event source is gone.
    pub async fn next(&mut self) -> Option<Result<Signal, WatchError>> {
        loop {
            let Some(burst) = self.burst else {
                if let Some(e) = self.deferred.take() {
                    return Some(Err(e));
                }
                match self.rx.recv().await? {
                    Ok(event) => {
                        debug!("Raw event {:?} opens a burst", event);
                        self.burst = Some(Burst {
                            first_at: Instant::now(),
                            events: 1,
                        });
                    }
                    Err(e) => return Some(Err(e)),
                }
                continue;
            };

            let close = tokio::select! {
                _ = sleep_until(burst.first_at + self.window) => true,
                next = self.rx.recv() => match next {
                    Some(Ok(event)) => {
                        debug!("Raw event {:?} absorbed", event);
                        self.burst = Some(Burst {
                            events: burst.events + 1,
                            ..burst
                        });
                        false
                    }
                    Some(Err(e)) => {
                        self.deferred = Some(e);
                        true
                    }
                    None => true,
                },
            };

            if close {
                let burst = self.burst.take().unwrap_or(burst);
                return Some(Ok(Signal {
                    events: burst.events,
                    first_at: burst.first_at,
                }));
            }
        }
    }
}

const DIR_MASK: WatchMask = WatchMask::CREATE
    .union(WatchMask::CLOSE_WRITE)
    .union(WatchMask::MODIFY)
    .union(WatchMask::MOVED_TO)
    .union(WatchMask::MOVED_FROM)
    .union(WatchMask::DELETE)
    .union(WatchMask::DELETE_SELF)
    .union(WatchMask::MOVE_SELF);

const FILE_MASK: WatchMask = WatchMask::MODIFY.union(WatchMask::CLOSE_WRITE);

/// Watches one file, surviving atomic replace and late creation.
pub struct FileWatcher {
    path: PathBuf,
    debouncer: Debouncer,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Registers the watches. Fails when the containing directory cannot be
    /// watched; a missing file is fine.
    pub fn spawn(path: &Path, window: Duration) -> Result<Self, WatchError> {
        let (dir, file_name) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => {
                let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
                (dir.to_path_buf(), name.to_os_string())
            }
            _ => return Err(WatchError::InvalidPath(path.to_path_buf())),
        };

        let metadata = std::fs::metadata(&dir).map_err(|source| WatchError::DirectoryInaccessible {
            path: dir.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(WatchError::DirectoryInaccessible {
                path: dir,
                source: io::Error::other("not a directory"),
            });
        }

        let inotify = Inotify::init().map_err(WatchError::Init)?;
        let mut watches = inotify.watches();
        let dir_wd = watches.add(&dir, DIR_MASK).map_err(|source| WatchError::Register {
            path: dir.clone(),
            source,
        })?;
        let file_wd = watch_file(&mut watches, path);

        let stream = inotify.into_event_stream([0u8; 4096]).map_err(WatchError::Init)?;
        let (tx, debouncer) = Debouncer::channel(window);

        let pump = Pump {
            watches,
            dir,
            dir_wd,
            file_path: path.to_path_buf(),
            file_name,
            file_wd,
            tx,
        };
        let task = tokio::spawn(pump.run(stream));

        info!("Watching {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            debouncer,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn next(&mut self) -> Option<Result<Signal, WatchError>> {
        self.debouncer.next().await
    }

    /// Drops the subscription. Pending signals are still delivered, then the
    /// sequence ends.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn watch_file(watches: &mut Watches, path: &Path) -> Option<WatchDescriptor> {
    match watches.add(path, FILE_MASK) {
        Ok(wd) => Some(wd),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{:?} does not exist yet, relying on the directory watch", path);
            None
        }
        Err(e) => {
            warn!("Could not watch {:?} directly: {}", path, e);
            None
        }
    }
}

struct Pump {
    watches: Watches,
    dir: PathBuf,
    dir_wd: WatchDescriptor,
    file_path: PathBuf,
    file_name: OsString,
    file_wd: Option<WatchDescriptor>,
    tx: mpsc::Sender<RawItem>,
}

impl Pump {
    async fn run(mut self, mut stream: EventStream<[u8; 4096]>) {
        loop {
            let item = match stream.next().await {
                Some(Ok(event)) => match self.classify(event.wd, event.mask, event.name) {
                    Some(raw) => raw,
                    None => continue,
                },
                Some(Err(e)) => Err(WatchError::Stream(e)),
                None => Err(WatchError::Stream(io::Error::other("inotify stream ended"))),
            };

            let fatal = item.is_err();
            if self.tx.send(item).await.is_err() || fatal {
                break;
            }
        }
    }

    fn classify(
        &mut self,
        wd: WatchDescriptor,
        mask: EventMask,
        name: Option<OsString>,
    ) -> Option<Result<RawEvent, WatchError>> {
        if mask.contains(EventMask::Q_OVERFLOW) {
            warn!("inotify queue overflowed, forcing a re-check");
            return Some(Ok(RawEvent::Overflow));
        }

        if wd == self.dir_wd {
            if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF | EventMask::IGNORED) {
                return Some(Err(WatchError::DirectoryRemoved(self.dir.clone())));
            }
            if name.as_deref() != Some(self.file_name.as_os_str()) {
                return None;
            }

            if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
                // A replaced file is a new inode; move the file watch to it.
                if let Some(old) = self.file_wd.take() {
                    let _ = self.watches.remove(old);
                }
                self.file_wd = watch_file(&mut self.watches, &self.file_path);
                return Some(Ok(RawEvent::Created));
            }
            if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
                return Some(Ok(RawEvent::Removed));
            }
            return Some(Ok(RawEvent::Modified));
        }

        if self.file_wd.as_ref() == Some(&wd) {
            if mask.contains(EventMask::IGNORED) {
                self.file_wd = None;
                return None;
            }
            return Some(Ok(RawEvent::Modified));
        }

        None
    }
}
