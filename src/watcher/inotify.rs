//! Native inotify backend.
//!
//! Unlike `NotifyBackend`, watch handles are the kernel watch descriptors
//! and every kernel event reaches the engine unchanged, including
//! `UNMOUNT` and the `IGNORED` that follows a vanished watch. A kernel
//! queue overflow, or an engine channel that is full, is reported through
//! `take_overflow`.

use std::{
    collections::HashMap,
    io::ErrorKind as IoErrorKind,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{Builder, JoinHandle, sleep},
    time::Duration,
};

use {
    async_channel::{Sender, TrySendError},
    inotify::{EventMask as KernelMask, Inotify, WatchDescriptor, WatchMask, Watches},
    parking_lot::Mutex,
    tracing::{debug, error, warn},
};

use crate::{
    error::domain::WatchError,
    watcher::{
        backend::{WatchBackend, io_watch_error},
        events::{EngineMessage, EventMask, RawEvent, WatchHandle},
    },
};

/// Pause between reads while the kernel queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn watch_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
}

type Descriptors = Arc<Mutex<HashMap<WatchHandle, WatchDescriptor>>>;

/// Backend reading the kernel inotify queue on its own thread.
pub struct InotifyBackend {
    watches: Watches,
    descriptors: Descriptors,
    overflowed: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl InotifyBackend {
    /// Creates the inotify instance and starts its reader thread.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Backend` if the instance or the thread cannot be
    /// created.
    pub fn new(sender: Sender<EngineMessage>) -> Result<Self, WatchError> {
        let inotify = Inotify::init().map_err(|e| WatchError::Backend {
            reason: format!("Failed to initialize inotify: {e}"),
        })?;
        let watches = inotify.watches();
        let descriptors = Descriptors::default();
        let overflowed = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = Reader {
            inotify,
            sender,
            descriptors: descriptors.clone(),
            overflowed: overflowed.clone(),
            stop: stop.clone(),
        };
        let reader = Builder::new()
            .name("inotify-reader".to_string())
            .spawn(move || reader.run())
            .map_err(|e| WatchError::Backend {
                reason: format!("Failed to spawn inotify reader: {e}"),
            })?;

        Ok(Self {
            watches,
            descriptors,
            overflowed,
            stop,
            reader: Some(reader),
        })
    }
}

impl WatchBackend for InotifyBackend {
    fn add_watch(&mut self, path: &Path) -> Result<WatchHandle, WatchError> {
        let descriptor = self
            .watches
            .add(path, watch_mask())
            .map_err(|e| match e.kind() {
                IoErrorKind::NotADirectory => WatchError::Backend {
                    reason: format!("{path:?} is not a directory"),
                },
                _ => io_watch_error(path, &e),
            })?;
        let handle = WatchHandle(descriptor.get_watch_descriptor_id());
        self.descriptors.lock().insert(handle, descriptor);
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> Result<(), WatchError> {
        let descriptor = self
            .descriptors
            .lock()
            .remove(&handle)
            .ok_or(WatchError::UnknownHandle { handle: handle.0 })?;
        if let Err(e) = self.watches.remove(descriptor) {
            debug!("Watch {} already gone: {}", handle.0, e);
        }
        Ok(())
    }

    fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            error!("inotify reader thread panicked");
        }
    }
}

struct Reader {
    inotify: Inotify,
    sender: Sender<EngineMessage>,
    descriptors: Descriptors,
    overflowed: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl Reader {
    fn run(mut self) {
        let mut buffer = [0u8; 4096];
        while !self.stop.load(Ordering::Acquire) {
            let events = match self.inotify.read_events(&mut buffer) {
                Ok(events) => events,
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                    sleep(POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    error!("Reading inotify events failed: {}", e);
                    return;
                }
            };

            for event in events {
                if event.mask.contains(KernelMask::Q_OVERFLOW) {
                    warn!("Kernel inotify queue overflowed");
                    self.signal_overflow();
                    continue;
                }

                let handle = WatchHandle(event.wd.get_watch_descriptor_id());
                if event.mask.contains(KernelMask::IGNORED) {
                    self.descriptors.lock().remove(&handle);
                }

                let raw = RawEvent::new(
                    handle,
                    EventMask::from_bits_truncate(event.mask.bits()),
                    event.name.unwrap_or_default(),
                );
                debug!("Watch event: {:?}", raw);
                match self.sender.try_send(EngineMessage::Event(raw)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => self.signal_overflow(),
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    fn signal_overflow(&self) {
        if !self.overflowed.swap(true, Ordering::AcqRel) {
            warn!("Watch events were lost, affected autoscans will be rescanned");
        }
        // Wakes the engine when the channel has room again.
        if let Err(e) = self.sender.try_send(EngineMessage::Wake) {
            debug!("Overflow wake skipped: {}", e);
        }
    }
}
