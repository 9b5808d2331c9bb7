//! OS watch backends.
//!
//! The engine talks to the OS through `WatchBackend`. On Linux the native
//! `InotifyBackend` is used. Elsewhere `NotifyBackend` uses the `notify`
//! crate with one non-recursive watch per directory and turns its events
//! back into inotify-style `RawEvent`s, including the `IGNORED` event the
//! kernel sends after a watched directory disappears.

use std::{
    collections::HashMap,
    fs::metadata,
    io::{Error as IoError, ErrorKind as IoErrorKind},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_channel::{Sender, TrySendError},
    notify::{
        Config, Error as NotifyError, ErrorKind, Event, EventKind, RecommendedWatcher,
        RecursiveMode::NonRecursive,
        Watcher,
        event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode},
    },
    parking_lot::Mutex,
    tracing::{debug, error, warn},
};

use crate::{
    error::domain::WatchError,
    watcher::events::{EngineMessage, EventMask, RawEvent, WatchHandle},
};

/// Registers and drops OS-level directory watches.
pub trait WatchBackend {
    /// Watches the directory at `path`.
    ///
    /// Watching an already watched path renews the OS watch and returns
    /// its existing handle.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::PermissionDenied`, `WatchError::NotFound` or
    /// `WatchError::WatchLimit` for the corresponding OS failures.
    fn add_watch(&mut self, path: &Path) -> Result<WatchHandle, WatchError>;

    /// Drops the watch `handle`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::UnknownHandle` if the handle is not registered.
    fn remove_watch(&mut self, handle: WatchHandle) -> Result<(), WatchError>;

    /// Returns `true` once after events were lost since the last call.
    fn take_overflow(&self) -> bool {
        false
    }
}

/// Path/handle registry shared between the backend and the notify thread.
#[derive(Debug, Default)]
pub struct HandleMap {
    by_path: HashMap<PathBuf, WatchHandle>,
    by_handle: HashMap<WatchHandle, PathBuf>,
    next: i32,
}

impl HandleMap {
    pub fn handle_of(&self, path: &Path) -> Option<WatchHandle> {
        self.by_path.get(path).copied()
    }

    /// Registers `path` under a fresh handle.
    pub fn insert(&mut self, path: &Path) -> WatchHandle {
        self.next += 1;
        let handle = WatchHandle(self.next);
        self.by_path.insert(path.to_path_buf(), handle);
        self.by_handle.insert(handle, path.to_path_buf());
        handle
    }

    pub fn remove_handle(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let path = self.by_handle.remove(&handle)?;
        self.by_path.remove(&path);
        Some(path)
    }

    pub fn remove_path(&mut self, path: &Path) -> Option<WatchHandle> {
        let handle = self.by_path.remove(path)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }
}

fn with_dir(mask: EventMask, is_dir: bool) -> EventMask {
    if is_dir { mask | EventMask::ISDIR } else { mask }
}

fn push_entry_event(out: &mut Vec<RawEvent>, handles: &HandleMap, path: &Path, mask: EventMask) {
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && let Some(handle) = handles.handle_of(parent)
    {
        out.push(RawEvent::new(handle, mask, name));
    }
}

fn push_self_events(out: &mut Vec<RawEvent>, handle: WatchHandle, mask: EventMask) {
    out.push(RawEvent::new(handle, mask, ""));
    out.push(RawEvent::new(handle, EventMask::IGNORED, ""));
}

/// Translates one `notify` event into raw watch events.
///
/// `stat` reports whether a path currently exists and is a directory
/// (`None` when it is missing). Watches whose directory vanished are
/// unregistered from `handles`.
pub fn translate(
    event: &Event,
    handles: &mut HandleMap,
    stat: impl Fn(&Path) -> Option<bool>,
) -> Vec<RawEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => stat(path).unwrap_or(false),
                };
                push_entry_event(&mut out, handles, path, with_dir(EventMask::CREATE, is_dir));
            }
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            for path in &event.paths {
                push_entry_event(&mut out, handles, path, EventMask::CLOSE_WRITE);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => {
            for path in &event.paths {
                let watched = handles.handle_of(path);
                let from = with_dir(EventMask::MOVED_FROM, watched.is_some());
                let to = with_dir(EventMask::MOVED_TO, stat(path).unwrap_or(false));
                match mode {
                    RenameMode::From => match watched {
                        Some(handle) if event.tracker().is_none() => {
                            out.push(RawEvent::new(handle, EventMask::MOVE_SELF, ""));
                        }
                        _ => push_entry_event(&mut out, handles, path, from),
                    },
                    RenameMode::To => push_entry_event(&mut out, handles, path, to),
                    // notify reports both halves separately as well
                    RenameMode::Both => {}
                    _ => {
                        let mask = if stat(path).is_some() { to } else { from };
                        push_entry_event(&mut out, handles, path, mask);
                    }
                }
            }
        }
        EventKind::Remove(kind) => {
            for path in &event.paths {
                match handles.remove_path(path) {
                    Some(handle) => push_self_events(&mut out, handle, EventMask::DELETE_SELF),
                    None => {
                        let is_dir = matches!(kind, RemoveKind::Folder);
                        push_entry_event(&mut out, handles, path, with_dir(EventMask::DELETE, is_dir));
                    }
                }
            }
        }
        _ => {}
    }
    out
}

fn stat_path(path: &Path) -> Option<bool> {
    metadata(path).ok().map(|metadata| metadata.is_dir())
}

pub(crate) fn io_watch_error(path: &Path, e: &IoError) -> WatchError {
    let path = path.to_path_buf();
    match e.kind() {
        IoErrorKind::NotFound => WatchError::NotFound { path },
        IoErrorKind::PermissionDenied => WatchError::PermissionDenied { path },
        IoErrorKind::StorageFull => WatchError::WatchLimit { path },
        _ => WatchError::Backend {
            reason: format!("{path:?}: {e}"),
        },
    }
}

fn notify_watch_error(path: &Path, e: &NotifyError) -> WatchError {
    match &e.kind {
        ErrorKind::MaxFilesWatch => WatchError::WatchLimit {
            path: path.to_path_buf(),
        },
        ErrorKind::PathNotFound => WatchError::NotFound {
            path: path.to_path_buf(),
        },
        ErrorKind::Io(io) => io_watch_error(path, io),
        _ => WatchError::Backend {
            reason: format!("{path:?}: {e}"),
        },
    }
}

/// Backend built on `notify::RecommendedWatcher`.
pub struct NotifyBackend {
    watcher: RecommendedWatcher,
    handles: Arc<Mutex<HandleMap>>,
    overflowed: Arc<AtomicBool>,
}

impl NotifyBackend {
    /// Creates the backend; translated events are sent to `sender`.
    ///
    /// Events are dropped when the channel is full, like the kernel does on
    /// queue overflow, and reported through `take_overflow`. Watcher errors
    /// make the engine check its roots against the filesystem.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Backend` if the OS watcher cannot be created.
    pub fn new(sender: Sender<EngineMessage>) -> Result<Self, WatchError> {
        let handles = Arc::new(Mutex::new(HandleMap::default()));
        let overflowed = Arc::new(AtomicBool::new(false));
        let map = handles.clone();
        let lost = overflowed.clone();

        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, NotifyError>| match res {
                Ok(event) => {
                    if event.need_rescan() {
                        warn!("Watch event queue overflowed, some changes were lost");
                        lost.store(true, Ordering::Release);
                    }
                    let translated = translate(&event, &mut map.lock(), stat_path);
                    for raw in translated {
                        debug!("Watch event: {:?}", raw);
                        match sender.try_send(EngineMessage::Event(raw)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                if !lost.swap(true, Ordering::AcqRel) {
                                    warn!("Watch event channel is full, dropping events");
                                }
                            }
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                }
                Err(e) => {
                    error!("File system watcher error: {}", e);
                    if let Err(e) = sender.try_send(EngineMessage::Recheck) {
                        debug!("Recheck request skipped: {}", e);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| WatchError::Backend {
            reason: format!("Failed to create file watcher: {e}"),
        })?;

        Ok(Self {
            watcher,
            handles,
            overflowed,
        })
    }
}

impl WatchBackend for NotifyBackend {
    fn add_watch(&mut self, path: &Path) -> Result<WatchHandle, WatchError> {
        let metadata = metadata(path).map_err(|e| io_watch_error(path, &e))?;
        if !metadata.is_dir() {
            return Err(WatchError::Backend {
                reason: format!("{path:?} is not a directory"),
            });
        }

        // Registered before watching so early events can be attributed.
        let existing = self.handles.lock().handle_of(path);
        let handle = existing.unwrap_or_else(|| self.handles.lock().insert(path));
        if let Err(e) = self.watcher.watch(path, NonRecursive) {
            self.handles.lock().remove_handle(handle);
            return Err(notify_watch_error(path, &e));
        }
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> Result<(), WatchError> {
        let path = self
            .handles
            .lock()
            .remove_handle(handle)
            .ok_or(WatchError::UnknownHandle { handle: handle.0 })?;
        if let Err(e) = self.watcher.unwatch(&path) {
            debug!("Watch on {:?} already gone: {}", path, e);
        }
        Ok(())
    }

    fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use notify::{
        Event, EventKind,
        event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode},
    };

    use {async_channel::bounded, tempfile::TempDir};

    use crate::watcher::{
        backend::{HandleMap, NotifyBackend, WatchBackend, translate},
        events::{EventMask, RawEvent, WatchHandle},
    };

    fn handles() -> (HandleMap, WatchHandle, WatchHandle) {
        let mut map = HandleMap::default();
        let media = map.insert(Path::new("/media"));
        let movies = map.insert(Path::new("/media/movies"));
        (map, media, movies)
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    fn missing(_: &Path) -> Option<bool> {
        None
    }

    #[test]
    fn test_translate_entry_events() {
        let (mut map, _, movies) = handles();

        let created = translate(
            &event(EventKind::Create(CreateKind::File), "/media/movies/a.mkv"),
            &mut map,
            missing,
        );
        assert_eq!(created, vec![RawEvent::new(movies, EventMask::CREATE, "a.mkv")]);

        let folder = translate(
            &event(EventKind::Create(CreateKind::Folder), "/media/movies/sub"),
            &mut map,
            missing,
        );
        assert_eq!(folder[0].mask, EventMask::CREATE | EventMask::ISDIR);

        let written = translate(
            &event(
                EventKind::Access(AccessKind::Close(AccessMode::Write)),
                "/media/movies/a.mkv",
            ),
            &mut map,
            missing,
        );
        assert_eq!(written, vec![RawEvent::new(movies, EventMask::CLOSE_WRITE, "a.mkv")]);

        let unwatched = translate(
            &event(EventKind::Create(CreateKind::File), "/srv/a.mkv"),
            &mut map,
            missing,
        );
        assert!(unwatched.is_empty());
    }

    #[test]
    fn test_translate_removal_of_watched_directory() {
        let (mut map, media, movies) = handles();

        let removed = translate(
            &event(EventKind::Remove(RemoveKind::Folder), "/media/movies"),
            &mut map,
            missing,
        );
        assert_eq!(
            removed,
            vec![
                RawEvent::new(movies, EventMask::DELETE_SELF, ""),
                RawEvent::new(movies, EventMask::IGNORED, ""),
            ]
        );
        assert!(map.handle_of(Path::new("/media/movies")).is_none());

        let from_parent = translate(
            &event(EventKind::Remove(RemoveKind::Folder), "/media/movies"),
            &mut map,
            missing,
        );
        assert_eq!(
            from_parent,
            vec![RawEvent::new(media, EventMask::DELETE | EventMask::ISDIR, "movies")]
        );
    }

    #[test]
    fn test_translate_renames() {
        let (mut map, media, movies) = handles();
        let from = EventKind::Modify(ModifyKind::Name(RenameMode::From));

        let moved_self = translate(&event(from, "/media/movies"), &mut map, missing);
        assert_eq!(moved_self, vec![RawEvent::new(movies, EventMask::MOVE_SELF, "")]);
        assert!(map.handle_of(Path::new("/media/movies")).is_some());

        let moved_away = translate(&event(from, "/media/movies").set_tracker(7), &mut map, missing);
        assert_eq!(
            moved_away,
            vec![RawEvent::new(media, EventMask::MOVED_FROM | EventMask::ISDIR, "movies")]
        );

        let moved_in = translate(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                "/media/movies/b.mkv",
            ),
            &mut map,
            |_| Some(false),
        );
        assert_eq!(moved_in, vec![RawEvent::new(movies, EventMask::MOVED_TO, "b.mkv")]);

        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/media/movies/b.mkv"))
            .add_path(PathBuf::from("/media/movies/c.mkv"));
        assert!(translate(&both, &mut map, missing).is_empty());
    }

    #[test]
    fn test_notify_backend_rewatches_released_path() {
        let dir = TempDir::new().unwrap();
        let (sender, _receiver) = bounded(16);
        let mut backend = NotifyBackend::new(sender).unwrap();

        let first = backend.add_watch(dir.path()).unwrap();
        assert_eq!(backend.add_watch(dir.path()).unwrap(), first);

        backend.remove_watch(first).unwrap();
        let second = backend.add_watch(dir.path()).unwrap();
        assert_ne!(second, first);
        assert!(backend.remove_watch(first).is_err());
        assert!(!backend.take_overflow());
    }
}
