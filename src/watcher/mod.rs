//! Filesystem watch engine.
//!
//! A single thread owns the OS watches of every inotify autoscan. Raw
//! events are turned into tasks on the shared `TaskQueue`; the engine never
//! mutates the catalog and only reads it to resolve paths to object ids.
//!
//! Each autoscan root (start point) also carries move watches on all of its
//! ancestors, so renaming any parent directory is noticed. Persistent roots
//! that disappear leave a waiting watch on their closest existing ancestor
//! and are re-armed once the path exists again.
//!
//! A moved or vanished directory takes every watch below it along. Roots
//! are also checked against the filesystem on request, which catches mounts
//! and unmounts that produce no event, and every root is rescanned after
//! watch events were lost.

pub mod backend;
pub mod events;
#[cfg(target_os = "linux")]
pub mod inotify;
pub mod table;

use std::{
    collections::VecDeque,
    ffi::OsStr,
    fs::{metadata, read_dir},
    path::{Path, PathBuf},
    sync::Arc,
    thread::{Builder, JoinHandle},
};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use {
    async_channel::{Receiver, Sender, bounded},
    parking_lot::Mutex,
    tracing::{debug, error, info, warn},
};

pub use {
    backend::{NotifyBackend, WatchBackend},
    events::{EngineMessage, EventMask, RawEvent, WatchHandle},
};

#[cfg(target_os = "linux")]
pub use self::inotify::InotifyBackend;

use crate::{
    autoscan::{AutoscanRef, ScanMode, is_hidden_name, normalize_path},
    content::{
        queue::TaskQueue,
        task::{AutoscanSetting, Task, TaskKind},
    },
    error::domain::WatchError,
    storage::{INVALID_OBJECT_ID, ObjectId, Storage},
    watcher::table::{Watch, WatchAutoscan, WatchMove, WatchNode, WatchTable},
};

/// Capacity of the event channel between the OS backend and the engine.
const EVENT_BUFFER: usize = 4096;

/// Default period between checks of the autoscan roots, in seconds.
pub const DEFAULT_RECHECK_INTERVAL_SECS: u64 = 10;

/// Filesystem a path lives on.
#[cfg(unix)]
fn device_of(path: &Path) -> Option<u64> {
    metadata(path).ok().map(|metadata| metadata.dev())
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> Option<u64> {
    None
}

#[derive(Debug, Default)]
struct Requests {
    monitor: VecDeque<AutoscanRef>,
    unmonitor: VecDeque<AutoscanRef>,
}

/// Watch bookkeeping driven by the engine thread.
struct EngineCore<B: WatchBackend> {
    backend: B,
    table: WatchTable,
    storage: Arc<dyn Storage>,
    tasks: Arc<TaskQueue>,
    follow_symlinks: bool,
}

impl<B: WatchBackend> EngineCore<B> {
    fn new(backend: B, storage: Arc<dyn Storage>, tasks: Arc<TaskQueue>, follow_symlinks: bool) -> Self {
        Self {
            backend,
            table: WatchTable::default(),
            storage,
            tasks,
            follow_symlinks,
        }
    }

    /// Handles queued unmonitor requests first, then monitor requests.
    fn process_requests(&mut self, requests: &Mutex<Requests>) {
        loop {
            let request = {
                let mut requests = requests.lock();
                match requests.unmonitor.pop_front() {
                    Some(adir) => Some((adir, false)),
                    None => requests.monitor.pop_front().map(|adir| (adir, true)),
                }
            };
            match request {
                Some((adir, true)) => self.handle_monitor(&adir),
                Some((adir, false)) => self.handle_unmonitor(&adir),
                None => break,
            }
        }
    }

    fn handle_monitor(&mut self, adir: &AutoscanRef) {
        let location = adir.location();
        let Some(root) = normalize_path(&location) else {
            warn!("Cannot monitor relative location {:?}", location);
            return;
        };

        info!("Monitoring autoscan directory {:?}", root);
        if adir.recursive() {
            self.monitor_tree(&root, adir, &root, true);
        } else {
            self.watch_directory(&root, adir, &root, true, None);
        }
        self.submit_rescan(adir, &root);
    }

    fn handle_unmonitor(&mut self, adir: &AutoscanRef) {
        info!("Removing watches of {:?}", adir.location());
        self.release_autoscan(adir);
    }

    fn release_autoscan(&mut self, adir: &AutoscanRef) {
        for handle in self.table.handles_of(adir) {
            self.release_autoscan_watches(handle, adir);
        }
    }

    /// Watches `path` and every non-hidden directory below it.
    ///
    /// Symlinked directories are not descended into.
    fn monitor_tree(&mut self, path: &Path, adir: &AutoscanRef, root: &Path, start_point: bool) {
        if self
            .watch_directory(path, adir, root, start_point, None)
            .is_none()
        {
            return;
        }

        let entries = match read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read directory {:?}: {}", path, e);
                return;
            }
        };

        let hidden = adir.hidden();
        for entry in entries.flatten() {
            if !hidden && is_hidden_name(&entry.file_name()) {
                continue;
            }
            if entry.file_type().is_ok_and(|file_type| file_type.is_dir()) {
                self.monitor_tree(&entry.path(), adir, root, false);
            }
        }
    }

    /// Adds an OS watch and records why the directory is watched.
    ///
    /// `nonexisting` is set when the directory stands in for a lost
    /// autoscan root. Returns `None` when the directory cannot be watched.
    fn watch_directory(
        &mut self,
        path: &Path,
        adir: &AutoscanRef,
        root: &Path,
        start_point: bool,
        nonexisting: Option<&Path>,
    ) -> Option<WatchHandle> {
        let handle = match self.backend.add_watch(path) {
            Ok(handle) => handle,
            Err(WatchError::NotFound { .. })
                if start_point && nonexisting.is_none() && adir.persistent() =>
            {
                debug!("Persistent autoscan {:?} is missing, waiting for it", path);
                self.watch_nonexisting(path, adir, root);
                return None;
            }
            Err(e @ WatchError::WatchLimit { .. }) => {
                error!("{}; changes below {:?} will be missed", e, path);
                return None;
            }
            Err(e) => {
                warn!("Cannot watch {:?}: {}", path, e);
                return None;
            }
        };

        let parent = if start_point {
            self.watch_path_for_moves(path, handle)
        } else {
            WatchHandle::UNKNOWN_PARENT
        };

        match self.table.get_mut(handle) {
            Some(node) => {
                if parent.is_valid() && !node.parent.is_valid() {
                    node.parent = parent;
                }
            }
            None => self.table.insert(WatchNode::new(path, handle, parent)),
        }

        let node = self.table.get_mut(handle)?;
        let already_watched = match nonexisting {
            None => node.autoscan_index(adir).is_some(),
            Some(lost) => node.nonexisting_index(lost).is_some(),
        };
        if already_watched {
            return Some(handle);
        }

        node.watches.push(Watch::Autoscan(WatchAutoscan {
            adir: adir.clone(),
            start_point,
            normalized_root: root.to_path_buf(),
            nonexisting_path: nonexisting.map(Path::to_path_buf),
            descendants: Vec::new(),
            device: if start_point { device_of(path) } else { None },
        }));

        if !start_point
            && nonexisting.is_none()
            && let Some(start) = self.table.find_by_path(root)
            && start != handle
            && let Some(start_node) = self.table.get_mut(start)
        {
            for watch in &mut start_node.watches {
                if let Watch::Autoscan(start_watch) = watch
                    && start_watch.start_point
                    && start_watch.adir.ptr_eq(adir)
                    && !start_watch.descendants.contains(&handle)
                {
                    start_watch.descendants.push(handle);
                }
            }
        }

        Some(handle)
    }

    /// Puts move watches on every ancestor of `path`, from `/` down.
    ///
    /// Returns the handle of the direct parent.
    fn watch_path_for_moves(&mut self, path: &Path, handle: WatchHandle) -> WatchHandle {
        let mut ancestors: Vec<PathBuf> = path.ancestors().skip(1).map(Path::to_path_buf).collect();
        ancestors.reverse();

        let mut parent = WatchHandle::ROOT_PARENT;
        for ancestor in ancestors {
            let ancestor_handle = match self.backend.add_watch(&ancestor) {
                Ok(ancestor_handle) => ancestor_handle,
                Err(e) => {
                    debug!("Cannot watch {:?} for moves: {}", ancestor, e);
                    parent = WatchHandle::UNKNOWN_PARENT;
                    continue;
                }
            };

            match self.table.get_mut(ancestor_handle) {
                Some(node) => {
                    if parent.is_valid() && !node.parent.is_valid() {
                        node.parent = parent;
                    }
                    if node.move_index(handle).is_none() {
                        node.watches.push(Watch::Move(WatchMove {
                            remove_handle: handle,
                        }));
                    }
                }
                None => {
                    let mut node = WatchNode::new(&ancestor, ancestor_handle, parent);
                    node.watches.push(Watch::Move(WatchMove {
                        remove_handle: handle,
                    }));
                    self.table.insert(node);
                }
            }
            parent = ancestor_handle;
        }
        parent
    }

    fn handle_event(&mut self, event: RawEvent) {
        let RawEvent { handle, mask, name } = event;

        let Some(node) = self.table.get(handle) else {
            if !mask.contains(EventMask::IGNORED)
                && let Err(e) = self.backend.remove_watch(handle)
            {
                debug!("Stray event {:?} on released watch: {}", mask, e);
            }
            return;
        };

        let is_self = mask.intersects(EventMask::SELF_EVENTS);
        let path = if is_self || name.is_empty() {
            node.path.clone()
        } else {
            node.path.join(&name)
        };
        let autoscan = node
            .appropriate_autoscan(&path)
            .map(|watch| (watch.adir.clone(), watch.normalized_root.clone()));
        debug!("{:?} on {:?}", mask, path);

        if mask.contains(EventMask::MOVE_SELF) {
            self.check_move_watches(handle);
        }
        if is_self
            || (mask.contains(EventMask::ISDIR)
                && mask.intersects(EventMask::CREATE | EventMask::MOVED_TO))
        {
            self.recheck_nonexisting_monitors(handle);
        }

        if let Some((adir, root)) = autoscan {
            if mask.intersects(EventMask::REMOVALS) {
                self.handle_removal(mask, &path);
            } else if mask.intersects(EventMask::ADDITIONS) {
                self.handle_addition(mask, &path, &name, &adir, &root);
            }
        }

        if mask.contains(EventMask::IGNORED) {
            self.purge(handle);
        }
    }

    fn handle_addition(
        &mut self,
        mask: EventMask,
        path: &Path,
        name: &OsStr,
        adir: &AutoscanRef,
        root: &Path,
    ) {
        if !adir.hidden() && is_hidden_name(name) {
            debug!("Skipping hidden entry {:?}", path);
            return;
        }

        if mask.contains(EventMask::ISDIR)
            && mask.intersects(EventMask::CREATE | EventMask::MOVED_TO)
            && adir.recursive()
        {
            self.monitor_tree(path, adir, root, false);
        }

        if self.tasks.has_pending_add(path) {
            debug!("Import of {:?} already queued", path);
            return;
        }

        let setting = AutoscanSetting {
            adir: Some(adir.clone()),
            recursive: adir.recursive(),
            hidden: adir.hidden(),
            follow_symlinks: self.follow_symlinks,
        };
        let task = Task::new(
            TaskKind::AddFile {
                path: path.to_path_buf(),
                root_path: root.to_path_buf(),
                setting,
            },
            format!("Importing: {}", path.display()),
        )
        .with_cancellable(false);
        self.tasks.add_task(task, true);
    }

    fn handle_removal(&mut self, mask: EventMask, path: &Path) {
        let dir_gone = mask.contains(EventMask::ISDIR)
            && mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM);
        if dir_gone || mask.intersects(EventMask::SELF_EVENTS) {
            for (adir, root) in self.release_tree(path) {
                self.start_point_lost(&adir, &root);
            }
        }
        self.submit_remove(path);
    }

    /// Drops every watch at or below `path`.
    ///
    /// Waiting watches found there move to the closest existing ancestor of
    /// the path they wait for. Returns the released start points.
    fn release_tree(&mut self, path: &Path) -> Vec<(AutoscanRef, PathBuf)> {
        let mut lost = Vec::new();
        let mut waiting = Vec::new();
        for handle in self.table.handles_under(path) {
            let Some(node) = self.table.get(handle) else {
                continue;
            };
            for watch in node.watches.iter().filter_map(Watch::as_autoscan) {
                let entry = (watch.adir.clone(), watch.normalized_root.clone());
                match &watch.nonexisting_path {
                    Some(missing) => waiting.push((missing.clone(), entry)),
                    None if watch.start_point => lost.push(entry),
                    None => {}
                }
            }
            self.drop_os_watch(handle);
        }

        for (missing, (adir, root)) in waiting {
            self.watch_nonexisting(&missing, &adir, &root);
        }
        lost
    }

    fn start_point_lost(&mut self, adir: &AutoscanRef, root: &Path) {
        if adir.persistent() {
            self.submit_persistent_removed(adir, root);
            self.watch_nonexisting(root, adir, root);
        }
    }

    /// Reacts to a rename of a directory carrying move watches.
    fn check_move_watches(&mut self, handle: WatchHandle) {
        let Some(node) = self.table.get(handle) else {
            return;
        };
        let targets: Vec<WatchHandle> = node
            .watches
            .iter()
            .filter_map(|watch| match watch {
                Watch::Move(mv) => Some(mv.remove_handle),
                Watch::Autoscan(_) => None,
            })
            .collect();

        for target in targets {
            if let Some(node) = self.table.get_mut(handle)
                && let Some(index) = node.move_index(target)
            {
                node.watches.remove(index);
            }

            let Some(path) = self.table.get(target).map(|node| node.path.clone()) else {
                continue;
            };
            let lost = self.release_tree(&path);
            if lost.is_empty() {
                continue;
            }
            for (adir, root) in lost {
                self.start_point_lost(&adir, &root);
            }
            self.submit_remove(&path);
        }

        if self
            .table
            .get(handle)
            .is_some_and(|node| node.watches.is_empty())
        {
            self.drop_os_watch(handle);
        }
    }

    fn recheck_nonexisting_monitors(&mut self, handle: WatchHandle) {
        let Some(node) = self.table.get(handle) else {
            return;
        };
        let waiting: Vec<(PathBuf, AutoscanRef, PathBuf)> = node
            .watches
            .iter()
            .filter_map(Watch::as_autoscan)
            .filter_map(|watch| {
                watch
                    .nonexisting_path
                    .clone()
                    .map(|lost| (lost, watch.adir.clone(), watch.normalized_root.clone()))
            })
            .collect();

        for (lost, adir, root) in waiting {
            self.recheck_nonexisting(Some(handle), &lost, &adir, &root);
        }
    }

    fn watch_nonexisting(&mut self, lost: &Path, adir: &AutoscanRef, root: &Path) {
        self.recheck_nonexisting(None, lost, adir, root);
    }

    /// Moves the waiting watch for `lost` to its closest existing ancestor,
    /// or re-arms the autoscan when `lost` itself exists again.
    fn recheck_nonexisting(
        &mut self,
        current: Option<WatchHandle>,
        lost: &Path,
        adir: &AutoscanRef,
        root: &Path,
    ) {
        let Some(candidate) = lost.ancestors().find(|ancestor| ancestor.is_dir()) else {
            return;
        };

        if candidate == lost {
            if let Some(current) = current {
                self.remove_nonexisting_monitor(current, lost);
            }
            self.reattach(adir, root);
            return;
        }

        let unchanged = current
            .and_then(|current| self.table.get(current))
            .is_some_and(|node| node.path == candidate);
        if unchanged {
            return;
        }

        if let Some(current) = current {
            self.remove_nonexisting_monitor(current, lost);
        }
        debug!("Waiting for {:?} from {:?}", lost, candidate);
        self.watch_directory(candidate, adir, root, false, Some(lost));
    }

    fn remove_nonexisting_monitor(&mut self, handle: WatchHandle, lost: &Path) {
        if let Some(index) = self
            .table
            .get(handle)
            .and_then(|node| node.nonexisting_index(lost))
        {
            self.release_watch(handle, index);
        }
    }

    fn reattach(&mut self, adir: &AutoscanRef, root: &Path) {
        info!("Autoscan directory {:?} is back", root);
        if adir.recursive() {
            self.monitor_tree(root, adir, root, true);
        } else {
            self.watch_directory(root, adir, root, true, None);
        }

        let task = Task::new(
            TaskKind::PersistentRecreated { adir: adir.clone() },
            format!("Reattaching: {}", root.display()),
        )
        .with_cancellable(false);
        self.tasks.add_task(task, false);
    }

    /// Releases every watch record `adir` holds on `handle`.
    fn release_autoscan_watches(&mut self, handle: WatchHandle, adir: &AutoscanRef) {
        loop {
            let Some(index) = self.table.get(handle).and_then(|node| {
                node.watches.iter().position(|watch| {
                    watch
                        .as_autoscan()
                        .is_some_and(|watch| watch.adir.ptr_eq(adir))
                })
            }) else {
                return;
            };
            self.release_watch(handle, index);
        }
    }

    /// Removes one watch record, dropping the OS watch with the last one.
    fn release_watch(&mut self, handle: WatchHandle, index: usize) {
        let Some(node) = self.table.get_mut(handle) else {
            return;
        };
        if node.watches.len() <= 1 {
            self.drop_os_watch(handle);
            return;
        }
        let removed = node.watches.remove(index);
        if removed.as_autoscan().is_some_and(|watch| watch.start_point) {
            self.remove_watch_moves(handle);
        }
    }

    fn drop_os_watch(&mut self, handle: WatchHandle) {
        if let Err(e) = self.backend.remove_watch(handle) {
            debug!("Watch {} already released: {}", handle.0, e);
        }
        self.purge(handle);
    }

    /// Forgets `handle` with its move watches and descendant watches.
    fn purge(&mut self, handle: WatchHandle) {
        if !self.table.contains(handle) {
            return;
        }
        self.remove_watch_moves(handle);

        let Some(node) = self.table.remove(handle) else {
            return;
        };

        for watch in node.watches.iter().filter_map(Watch::as_autoscan) {
            if watch.start_point {
                for &descendant in &watch.descendants {
                    self.release_autoscan_watches(descendant, &watch.adir);
                }
            } else if let Some(start) = self.table.find_by_path(&watch.normalized_root)
                && let Some(start_node) = self.table.get_mut(start)
            {
                for start_watch in &mut start_node.watches {
                    if let Watch::Autoscan(start_watch) = start_watch
                        && start_watch.adir.ptr_eq(&watch.adir)
                    {
                        start_watch.descendants.retain(|&d| d != handle);
                    }
                }
            }
        }
        debug!("Released watch on {:?}", node.path);
    }

    /// Drops the move watches ancestors keep for `handle`.
    fn remove_watch_moves(&mut self, handle: WatchHandle) {
        let mut parent = match self.table.get(handle) {
            Some(node) => node.parent,
            None => return,
        };

        while parent.is_valid() {
            let Some(node) = self.table.get_mut(parent) else {
                break;
            };
            let next = node.parent;
            if let Some(index) = node.move_index(handle) {
                if node.watches.len() == 1 {
                    self.drop_os_watch(parent);
                } else {
                    node.watches.remove(index);
                }
            }
            parent = next;
        }
    }

    /// Compares start points and waiting roots with the filesystem.
    ///
    /// Catches roots that vanished, or were mounted over or unmounted,
    /// without a watch event.
    fn recheck_roots(&mut self) {
        for handle in self.table.waiting_handles() {
            self.recheck_nonexisting_monitors(handle);
        }

        for (handle, watch) in self.table.start_points() {
            let current = self
                .table
                .get(handle)
                .is_some_and(|node| node.autoscan_index(&watch.adir).is_some());
            if !current {
                continue;
            }

            let WatchAutoscan {
                adir,
                normalized_root: root,
                device,
                ..
            } = watch;
            if !root.is_dir() {
                info!("Autoscan directory {:?} disappeared", root);
                for (adir, root) in self.release_tree(&root) {
                    self.start_point_lost(&adir, &root);
                }
                self.submit_remove(&root);
            } else if device_of(&root) != device {
                info!("Filesystem at {:?} changed", root);
                self.release_autoscan(&adir);
                if adir.persistent() {
                    self.submit_persistent_removed(&adir, &root);
                    self.reattach(&adir, &root);
                } else {
                    self.handle_monitor(&adir);
                }
            }
        }
    }

    /// Re-watches and rescans every autoscan after watch events were lost.
    fn rescan_all(&mut self) {
        self.recheck_roots();

        let mut rescanned: Vec<AutoscanRef> = Vec::new();
        for (_, watch) in self.table.start_points() {
            if rescanned.iter().any(|adir| adir.ptr_eq(&watch.adir)) {
                continue;
            }
            let root = watch.normalized_root;
            warn!("Watch events were lost, rescanning {:?}", root);
            if watch.adir.recursive() {
                self.monitor_tree(&root, &watch.adir, &root, true);
            }
            self.submit_rescan(&watch.adir, &root);
            rescanned.push(watch.adir);
        }
    }

    fn submit_remove(&self, path: &Path) {
        match self.storage.find_object_id_by_path(path) {
            Ok(INVALID_OBJECT_ID) => debug!("No catalog object for {:?}", path),
            Ok(object_id) => {
                let task = Task::new(
                    TaskKind::RemoveObject {
                        object_id,
                        all: false,
                    },
                    format!("Removing: {}", path.display()),
                );
                self.tasks.add_task(task, false);
            }
            Err(e) => warn!("Cannot resolve {:?}: {}", path, e),
        }
    }

    fn submit_persistent_removed(&self, adir: &AutoscanRef, root: &Path) {
        info!("Persistent autoscan directory {:?} is gone, waiting for it to return", root);
        let task = Task::new(
            TaskKind::PersistentRemoved { adir: adir.clone() },
            format!("Detaching: {}", root.display()),
        )
        .with_cancellable(false);
        self.tasks.add_task(task, false);
    }

    fn submit_rescan(&self, adir: &AutoscanRef, root: &Path) {
        let object_id: ObjectId = {
            let mut dir = adir.lock();
            dir.inc_task_count();
            dir.object_id()
        };
        let task = Task::new(
            TaskKind::RescanDirectory {
                adir: adir.clone(),
                object_id,
                desc_path: root.to_path_buf(),
            },
            format!("Scan: {}", root.display()),
        )
        .with_cancellable(false);
        self.tasks.add_task(task, true);
    }
}

/// Handle to the watch engine thread.
pub struct WatchEngine {
    requests: Arc<Mutex<Requests>>,
    sender: Sender<EngineMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WatchEngine {
    /// Starts the engine on top of the OS watch facility.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Backend` if the OS watcher or the engine thread
    /// cannot be created.
    pub fn start(
        storage: Arc<dyn Storage>,
        tasks: Arc<TaskQueue>,
        follow_symlinks: bool,
    ) -> Result<Self, WatchError> {
        let (sender, receiver) = bounded(EVENT_BUFFER);
        #[cfg(target_os = "linux")]
        let backend = InotifyBackend::new(sender.clone())?;
        #[cfg(not(target_os = "linux"))]
        let backend = NotifyBackend::new(sender.clone())?;
        Self::spawn(backend, sender, receiver, storage, tasks, follow_symlinks)
    }

    /// Starts the engine with a custom backend feeding `receiver`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Backend` if the thread cannot be spawned.
    pub fn spawn<B: WatchBackend + Send + 'static>(
        backend: B,
        sender: Sender<EngineMessage>,
        receiver: Receiver<EngineMessage>,
        storage: Arc<dyn Storage>,
        tasks: Arc<TaskQueue>,
        follow_symlinks: bool,
    ) -> Result<Self, WatchError> {
        let requests = Arc::new(Mutex::new(Requests::default()));
        let thread_requests = requests.clone();
        let mut core = EngineCore::new(backend, storage, tasks, follow_symlinks);

        let thread = Builder::new()
            .name("watch-engine".to_string())
            .spawn(move || {
                debug!("Watch engine started");
                loop {
                    core.process_requests(&thread_requests);
                    match receiver.recv_blocking() {
                        Ok(EngineMessage::Event(event)) => core.handle_event(event),
                        Ok(EngineMessage::Wake) => {}
                        Ok(EngineMessage::Recheck) => core.recheck_roots(),
                        Ok(EngineMessage::Shutdown) | Err(_) => break,
                    }
                    if core.backend.take_overflow() {
                        core.rescan_all();
                    }
                }
                debug!("Watch engine stopped");
            })
            .map_err(|e| WatchError::Backend {
                reason: format!("Failed to spawn watch engine: {e}"),
            })?;

        Ok(Self {
            requests,
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `adir` for watching.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidRequest` unless `adir` is an inotify
    /// autoscan.
    pub fn monitor(&self, adir: &AutoscanRef) -> Result<(), WatchError> {
        if adir.mode() != ScanMode::INotify {
            return Err(WatchError::InvalidRequest {
                reason: format!("{:?} is not an inotify autoscan", adir.location()),
            });
        }
        self.requests.lock().monitor.push_back(adir.clone());
        self.wake();
        Ok(())
    }

    /// Queues removal of every watch of `adir`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::InvalidRequest` for persistent autoscans, which
    /// keep waiting for their root instead.
    pub fn unmonitor(&self, adir: &AutoscanRef) -> Result<(), WatchError> {
        if adir.persistent() {
            return Err(WatchError::InvalidRequest {
                reason: format!("{:?} is persistent", adir.location()),
            });
        }
        self.requests.lock().unmonitor.push_back(adir.clone());
        self.wake();
        Ok(())
    }

    /// Asks the engine to compare its roots with the filesystem.
    pub fn recheck(&self) {
        if let Err(e) = self.sender.try_send(EngineMessage::Recheck) {
            debug!("Watch recheck skipped: {}", e);
        }
    }

    fn wake(&self) {
        // A full channel means the engine is awake anyway.
        if let Err(e) = self.sender.try_send(EngineMessage::Wake) {
            debug!("Watch engine wake skipped: {}", e);
        }
    }

    /// Stops the engine thread and waits for it.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if self.sender.send_blocking(EngineMessage::Shutdown).is_err() {
            debug!("Watch engine already stopped");
        }
        if thread.join().is_err() {
            error!("Watch engine thread panicked");
        }
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
