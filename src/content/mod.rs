//! Content manager: the single writer of the catalog.
//!
//! Every catalog mutation runs as a `Task` on one worker thread. Public
//! operations either run the import logic inline or enqueue a task; the
//! watch engine and the rescan timer only ever enqueue tasks.

pub mod import;
pub mod online;
pub mod queue;
pub mod task;
pub mod timer;

use std::{
    collections::{HashMap, HashSet},
    fs::symlink_metadata,
    path::{Path, PathBuf},
    result::Result as StdResult,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{Builder, JoinHandle},
    time::Duration,
};

use {
    anyhow::Context,
    parking_lot::Mutex,
    tracing::{debug, error, info, warn},
};

pub use {
    import::{Importer, RescanOutcome},
    online::{ONLINE_ROOT_TITLE, OnlineItem, OnlineService, StaticService},
    queue::TaskQueue,
    task::{AutoscanSetting, CancellationToken, NO_TASK, Task, TaskId, TaskInfo, TaskKind, TaskOwner},
    timer::{RescanTimer, TimerKey},
};

use crate::{
    autoscan::{
        AutoscanDirectory, AutoscanHandle, AutoscanList, AutoscanRef, INVALID_STORAGE_ID,
        ScanMode, normalize_path,
    },
    config::ServerSettings,
    error::{
        domain::{CatalogError, ContentError, Result, TimerError},
        operational::{ErrorReporter, ResultExt},
    },
    storage::{CdsObject, FS_ROOT_ID, INVALID_OBJECT_ID, ObjectId, ROOT_ID, Storage},
    update::{FlushPolicy, UpdateCoalescer},
    watcher::{DEFAULT_RECHECK_INTERVAL_SECS, WatchEngine},
};

/// Import behaviour shared by all content operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentOptions {
    /// Whether inotify autoscans are served by a watch engine.
    pub use_inotify: bool,
    /// Hidden-file policy for imports outside any autoscan.
    pub import_hidden: bool,
    pub follow_symlinks: bool,
    /// Skip files whose extension has no known MIME type.
    pub ignore_unknown_extensions: bool,
    /// Period of the inotify root checks; zero disables them.
    pub watch_recheck_interval: Duration,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            use_inotify: true,
            import_hidden: false,
            follow_symlinks: true,
            ignore_unknown_extensions: false,
            watch_recheck_interval: Duration::from_secs(DEFAULT_RECHECK_INTERVAL_SECS),
        }
    }
}

impl From<&ServerSettings> for ContentOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            use_inotify: settings.use_inotify,
            import_hidden: settings.import_hidden_files,
            follow_symlinks: settings.follow_symlinks,
            ignore_unknown_extensions: settings.ignore_unknown_extensions,
            watch_recheck_interval: Duration::from_secs(settings.watch_recheck_secs),
        }
    }
}

/// Ways to address a listed autoscan directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoscanKey {
    Handle(AutoscanHandle, ScanMode),
    Location(PathBuf),
    Object(ObjectId),
}

struct ContentInner {
    storage: Arc<dyn Storage>,
    updates: Arc<UpdateCoalescer>,
    tasks: Arc<TaskQueue>,
    timed: AutoscanList,
    inotify: AutoscanList,
    watcher: Mutex<Option<WatchEngine>>,
    timer: RescanTimer,
    services: Mutex<Vec<Arc<dyn OnlineService>>>,
    options: ContentOptions,
    running: AtomicBool,
}

/// Orchestrates imports, removals, rescans and autoscan bookkeeping.
pub struct ContentManager {
    inner: Arc<ContentInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContentManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        updates: Arc<UpdateCoalescer>,
        options: ContentOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ContentInner {
                storage,
                updates,
                tasks: Arc::new(TaskQueue::new()),
                timed: AutoscanList::new(),
                inotify: AutoscanList::new(),
                watcher: Mutex::new(None),
                timer: RescanTimer::new(),
                services: Mutex::new(Vec::new()),
                options,
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Loads the autoscan directories and starts the background threads.
    ///
    /// Configured entries are merged with the stored ones: a stored entry at
    /// the same location contributes its storage id, catalog container and
    /// watermarks. Stored persistent entries missing from `configured` were
    /// dropped from the configuration and are deleted; stored non-persistent
    /// entries were added at runtime and are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored entries cannot be read or a thread
    /// cannot be started.
    pub fn start(&self, configured: Vec<AutoscanDirectory>) -> Result<()> {
        let inner = &self.inner;
        let stored = inner
            .storage
            .get_autoscan_directories()
            .add_context("Failed to load stored autoscan directories")?;
        let mut matched: HashSet<i64> = HashSet::new();

        for mut dir in configured {
            if let Some(saved) = stored
                .iter()
                .find(|saved| saved.location() == dir.location())
            {
                matched.insert(saved.storage_id());
                dir.set_storage_id(saved.storage_id());
                dir.set_object_id(saved.object_id());
                if saved.mode() == dir.mode() {
                    dir.restore_watermarks(saved.watermarks());
                }
            }
            inner.load_entry(dir)?;
        }

        for saved in stored {
            if matched.contains(&saved.storage_id())
                || inner
                    .lookup(&AutoscanKey::Location(saved.location().to_path_buf()))
                    .is_some()
            {
                continue;
            }
            if saved.persistent() {
                info!(
                    "Autoscan {:?} is no longer configured, forgetting it",
                    saved.location()
                );
                inner
                    .storage
                    .remove_autoscan_directory(saved.storage_id())
                    .add_contextf(format!("Failed to remove autoscan {:?}", saved.location()))?;
            } else {
                inner.load_entry(saved)?;
            }
        }

        let worker_inner = inner.clone();
        let worker = Builder::new()
            .name("content-worker".to_string())
            .spawn(move || worker_inner.run())
            .add_context("Failed to spawn content worker")?;
        *self.worker.lock() = Some(worker);

        if inner.options.use_inotify {
            let engine = WatchEngine::start(
                inner.storage.clone(),
                inner.tasks.clone(),
                inner.options.follow_symlinks,
            )
            .add_context("Failed to start watch engine")?;
            *inner.watcher.lock() = Some(engine);
        }

        let weak: Weak<ContentInner> = Arc::downgrade(inner);
        inner
            .timer
            .start(Arc::new(move |key: &TimerKey| {
                if let Some(inner) = weak.upgrade() {
                    inner.timer_fired(key);
                }
            }))
            .add_context("Failed to start rescan timer")?;

        inner.running.store(true, Ordering::Release);
        for adir in inner.timed.snapshot().iter().chain(inner.inotify.snapshot().iter()) {
            inner.arm(adir);
        }
        let services = inner.services.lock().clone();
        for service in &services {
            inner.arm_service(service);
        }
        if inner.watcher.lock().is_some() && !inner.options.watch_recheck_interval.is_zero() {
            inner
                .timer
                .schedule(TimerKey::WatchRecheck, inner.options.watch_recheck_interval, false)
                .add_context("Failed to schedule watch recheck")?;
        }

        info!(
            "Content manager started with {} timed and {} inotify autoscans",
            inner.timed.len(),
            inner.inotify.len()
        );
        Ok(())
    }

    /// Stops every thread and persists the autoscan watermarks.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        inner.running.store(false, Ordering::Release);

        inner.timer.shutdown();
        let engine = inner.watcher.lock().take();
        if let Some(engine) = engine {
            engine.shutdown();
        }
        inner.tasks.shutdown();
        if worker.join().is_err() {
            error!("Content worker thread panicked");
        }

        for adir in inner.timed.snapshot().iter().chain(inner.inotify.snapshot().iter()) {
            inner.persist(adir);
        }
        info!("Content manager stopped");
    }

    /// Imports `path` into the catalog.
    ///
    /// With `run_async` the import is queued and `INVALID_OBJECT_ID` is
    /// returned; otherwise it runs on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::InvalidPath` for relative paths and
    /// `ContentError::PathNotFound` if nothing exists at `path`.
    pub fn add_file(
        &self,
        path: &Path,
        recursive: bool,
        run_async: bool,
        hidden: bool,
        low_priority: bool,
        cancellable: bool,
    ) -> StdResult<ObjectId, ContentError> {
        let path = normalize_path(path).ok_or_else(|| ContentError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        if symlink_metadata(&path).is_err() {
            return Err(ContentError::PathNotFound { path });
        }

        let inner = &self.inner;
        let adir = inner.inotify.find_containing(&path);
        let root_path = adir.as_ref().map(AutoscanRef::location).unwrap_or_default();
        let setting = AutoscanSetting {
            adir,
            recursive,
            hidden,
            follow_symlinks: inner.options.follow_symlinks,
        };

        if run_async {
            let task = Task::new(
                TaskKind::AddFile {
                    path: path.clone(),
                    root_path,
                    setting,
                },
                format!("Importing: {}", path.display()),
            )
            .with_cancellable(cancellable);
            inner.tasks.add_task(task, low_priority);
            return Ok(INVALID_OBJECT_ID);
        }
        inner.importer().add_file(&path, &setting, None)
    }

    /// Imports `path` with the configured hidden-file policy.
    ///
    /// # Errors
    ///
    /// Same as `add_file`.
    pub fn add_file_default(&self, path: &Path, recursive: bool) -> StdResult<ObjectId, ContentError> {
        self.add_file(
            path,
            recursive,
            true,
            self.inner.options.import_hidden,
            true,
            true,
        )
    }

    /// Removes an object and its subtree from the catalog.
    ///
    /// Autoscan directories nested in a removed container are retired and
    /// queued imports below it are invalidated.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::ProtectedObject` for the root containers and
    /// `CatalogError::NotFound` for unknown ids.
    pub fn remove_object(
        &self,
        object_id: ObjectId,
        run_async: bool,
        all: bool,
    ) -> StdResult<(), ContentError> {
        if object_id == ROOT_ID || object_id == FS_ROOT_ID {
            return Err(ContentError::ProtectedObject { id: object_id });
        }
        let object = self.inner.storage.load_object(object_id)?;

        if run_async {
            let task = Task::new(
                TaskKind::RemoveObject { object_id, all },
                format!("Removing: {}", describe(&object)),
            );
            self.inner.tasks.add_task(task, false);
            return Ok(());
        }
        self.inner.remove_object_now(object_id, all, None)
    }

    /// Queues a rescan of container `object_id` of an autoscan directory.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::UnknownAutoscan` if no entry has `handle`.
    pub fn rescan_directory(
        &self,
        object_id: ObjectId,
        handle: AutoscanHandle,
        mode: ScanMode,
        desc_path: Option<&Path>,
        cancellable: bool,
    ) -> StdResult<TaskId, ContentError> {
        let inner = &self.inner;
        let adir = inner
            .list_for(mode)
            .get(handle)
            .ok_or(ContentError::UnknownAutoscan)?;
        let desc_path = desc_path.map_or_else(|| adir.location(), Path::to_path_buf);
        Ok(inner
            .importer()
            .submit_rescan(&adir, object_id, &desc_path, cancellable, NO_TASK))
    }

    /// Adds an autoscan directory, or updates the entry at the same location.
    ///
    /// An empty location is resolved from the entry's object id. Updates
    /// copy the editable settings and may move the entry to the other mode,
    /// which assigns a new handle and forgets the watermarks.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::InotifyDisabled`, `NotAContainer`,
    /// `InvalidPath`, `PathNotFound` or `PersistentAutoscan`, or the storage
    /// error that prevented persisting the entry.
    pub fn set_autoscan_directory(
        &self,
        dir: AutoscanDirectory,
    ) -> StdResult<AutoscanHandle, ContentError> {
        let inner = &self.inner;
        if dir.mode() == ScanMode::INotify && !inner.options.use_inotify {
            return Err(ContentError::InotifyDisabled);
        }

        let location = inner.resolve_location(&dir)?;
        match inner.lookup(&AutoscanKey::Location(location.clone())) {
            Some(current) => inner.update_autoscan(&current, &dir),
            None => inner.add_autoscan(location, &dir),
        }
    }

    /// Removes a non-persistent autoscan directory.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::UnknownAutoscan` if nothing matches `key` and
    /// `ContentError::PersistentAutoscan` for persistent entries.
    pub fn remove_autoscan_directory(&self, key: &AutoscanKey) -> StdResult<(), ContentError> {
        let inner = &self.inner;
        let adir = inner.lookup(key).ok_or(ContentError::UnknownAutoscan)?;
        if adir.persistent() {
            return Err(ContentError::PersistentAutoscan {
                location: adir.location(),
            });
        }
        inner.retire(&adir);
        Ok(())
    }

    /// Copies of the entries of one mode, in insertion order.
    pub fn get_autoscan_directories(&self, mode: ScanMode) -> Vec<AutoscanDirectory> {
        self.inner.list_for(mode).copies()
    }

    pub fn get_autoscan_directory(&self, key: &AutoscanKey) -> Option<AutoscanDirectory> {
        self.inner.lookup(key).map(|adir| adir.snapshot())
    }

    /// Registers an online service and schedules its refreshes.
    pub fn register_online_service(&self, service: Arc<dyn OnlineService>) {
        let inner = &self.inner;
        {
            let mut services = inner.services.lock();
            if services.iter().any(|known| known.name() == service.name()) {
                warn!("Online service {} is already registered", service.name());
                return;
            }
            services.push(service.clone());
        }
        if inner.running.load(Ordering::Acquire) {
            inner.arm_service(&service);
        }
    }

    pub fn invalidate_task(&self, task_id: TaskId, owner: TaskOwner) {
        self.inner.tasks.invalidate_task(task_id, owner);
    }

    pub fn current_task(&self) -> Option<TaskInfo> {
        self.inner.tasks.current_task()
    }

    pub fn task_list(&self) -> Vec<TaskInfo> {
        self.inner.tasks.task_list()
    }

    /// Queue shared with the watch engine.
    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.inner.tasks
    }
}

impl Drop for ContentManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn describe(object: &CdsObject) -> String {
    if object.location.as_os_str().is_empty() {
        object.title.clone()
    } else {
        object.location.display().to_string()
    }
}

impl ContentInner {
    fn importer(&self) -> Importer<'_> {
        Importer::new(
            self.storage.as_ref(),
            &self.updates,
            &self.tasks,
            self.options.ignore_unknown_extensions,
        )
    }

    fn list_for(&self, mode: ScanMode) -> &AutoscanList {
        match mode {
            ScanMode::Timed => &self.timed,
            ScanMode::INotify => &self.inotify,
        }
    }

    fn lookup(&self, key: &AutoscanKey) -> Option<AutoscanRef> {
        match key {
            AutoscanKey::Handle(handle, mode) => self.list_for(*mode).get(*handle),
            AutoscanKey::Location(location) => {
                let location = normalize_path(location)?;
                self.timed
                    .get_by_location(&location)
                    .or_else(|| self.inotify.get_by_location(&location))
            }
            AutoscanKey::Object(object_id) => self
                .timed
                .get_by_object_id(*object_id)
                .or_else(|| self.inotify.get_by_object_id(*object_id)),
        }
    }

    fn run(&self) {
        debug!("Content worker started");
        while let Some(task) = self.tasks.pop_blocking() {
            debug!("Running task {}: {}", task.id, task.description);
            match self.run_task(&task) {
                Ok(()) => {}
                Err(e) if task.is_cancelled() => ErrorReporter::debug(&e, &task.description),
                Err(e) => ErrorReporter::warn(&e, &task.description),
            }
            self.tasks.finish_current();
        }
        debug!("Content worker stopped");
    }

    fn run_task(&self, task: &Task) -> Result<()> {
        match &task.kind {
            TaskKind::AddFile { path, setting, .. } => {
                self.importer()
                    .add_file(path, setting, Some(&task.token))
                    .add_contextf(format!("Failed to import {}", path.display()))?;
            }
            TaskKind::RemoveObject { object_id, all } => {
                self.remove_object_now(*object_id, *all, Some(task.id))
                    .add_contextf(format!("Failed to remove object {object_id}"))?;
            }
            TaskKind::RescanDirectory {
                adir,
                object_id,
                desc_path,
            } => self.run_rescan(task, adir, *object_id, desc_path)?,
            TaskKind::PersistentRemoved { adir } => {
                info!("Detaching autoscan {:?} from its container", adir.location());
                adir.lock().set_object_id(INVALID_OBJECT_ID);
                self.persist(adir);
            }
            TaskKind::PersistentRecreated { adir } => self.reattach(task, adir)?,
            TaskKind::FetchOnlineContent { service } => self.fetch_online(task, service.as_ref())?,
        }
        Ok(())
    }

    fn remove_object_now(
        &self,
        object_id: ObjectId,
        all: bool,
        before: Option<TaskId>,
    ) -> StdResult<(), ContentError> {
        let object = match self.storage.load_object(object_id) {
            Ok(object) => object,
            Err(CatalogError::NotFound { .. }) => {
                debug!("Object {} already removed", object_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if object.is_container() && !object.location.as_os_str().is_empty() {
            self.retire_nested(&object.location);
            self.tasks.invalidate_add_tasks_under(&object.location, before);
        }
        self.importer().remove_object(object_id, all)
    }

    /// Retires the non-persistent autoscans at or below `path`.
    ///
    /// Timer subscriptions of retired timed entries fire once more and find
    /// no entry.
    fn retire_nested(&self, path: &Path) {
        let retired = self
            .timed
            .remove_if_subdir(path, false)
            .into_iter()
            .chain(self.inotify.remove_if_subdir(path, false));
        for adir in retired {
            info!("Retiring autoscan {:?} with its removed parent", adir.location());
            if adir.mode() == ScanMode::INotify {
                self.unmonitor(&adir);
            }
            self.forget(&adir);
        }
    }

    fn run_rescan(
        &self,
        task: &Task,
        adir: &AutoscanRef,
        object_id: ObjectId,
        desc_path: &Path,
    ) -> Result<()> {
        let outcome = self
            .importer()
            .rescan_directory(adir, object_id, task, self.options.follow_symlinks)
            .add_contextf(format!("Failed to rescan {}", desc_path.display()));
        let remaining = adir.lock().dec_task_count();

        match outcome {
            Ok(RescanOutcome::Retire) => {
                info!("Autoscan root {:?} is gone, removing the entry", adir.location());
                if !adir.persistent() {
                    self.retire(adir);
                }
            }
            Ok(RescanOutcome::RootMissing) => {
                debug!("Persistent autoscan root {:?} is missing", adir.location());
            }
            Ok(RescanOutcome::Done) | Err(_) => {}
        }
        if remaining == 0 {
            self.scan_finished(adir);
        }
        outcome.map(|_| ())
    }

    /// Promotes the watermarks and re-arms a timed entry.
    fn scan_finished(&self, adir: &AutoscanRef) {
        adir.lock().update_lmt();
        let Some(handle) = adir.scan_id() else {
            return;
        };
        self.persist(adir);

        if adir.mode() != ScanMode::Timed || !self.running.load(Ordering::Acquire) {
            return;
        }
        if !self.timed.get(handle).is_some_and(|listed| listed.ptr_eq(adir)) {
            return;
        }
        let interval = Duration::from_secs(u64::from(adir.lock().interval()));
        match self.timer.schedule(TimerKey::Autoscan(handle), interval, true) {
            Ok(()) => {}
            Err(TimerError::AlreadyScheduled { .. }) => {
                debug!("Autoscan {} is already scheduled", handle);
            }
            Err(e) => warn!("Cannot schedule autoscan {:?}: {}", adir.location(), e),
        }
    }

    fn reattach(&self, task: &Task, adir: &AutoscanRef) -> Result<()> {
        let location = adir.location();
        let object_id = self
            .importer()
            .ensure_path_existence(&location)
            .add_contextf(format!("Failed to recreate container for {}", location.display()))?;
        adir.lock().set_object_id(object_id);
        self.persist(adir);

        info!("Rescanning reattached autoscan {:?}", location);
        self.importer()
            .submit_rescan(adir, object_id, &location, false, task.id);
        Ok(())
    }

    fn fetch_online(&self, task: &Task, service: &dyn OnlineService) -> Result<()> {
        let name = service.name();
        let container = self
            .storage
            .add_container_chain(&[ONLINE_ROOT_TITLE, name])
            .add_contextf(format!("Failed to create container for {name}"))?;
        if let Some(changed) = container.changed {
            self.updates.container_changed(changed, FlushPolicy::Scheduled);
        }

        let items = service
            .fetch(&task.token)
            .with_context(|| format!("Failed to fetch online service {name}"))?;
        if task.is_cancelled() {
            return Ok(());
        }

        let known: HashMap<String, ObjectId> = self
            .storage
            .get_children(container.id, true)
            .add_contextf(format!("Failed to list items of {name}"))?
            .into_iter()
            .filter_map(|object| object.url.map(|url| (url, object.id)))
            .collect();
        let wanted: HashSet<&str> = items.iter().map(|item| item.url.as_str()).collect();

        let stale: Vec<ObjectId> = known
            .iter()
            .filter(|(url, _)| !wanted.contains(url.as_str()))
            .map(|(_, id)| *id)
            .collect();
        let mut changed = !stale.is_empty();
        if changed {
            self.storage
                .remove_objects(&stale, false)
                .add_contextf(format!("Failed to drop stale items of {name}"))?;
        }

        for item in items.iter().filter(|item| !known.contains_key(&item.url)) {
            self.storage
                .add_object(CdsObject::external_url(
                    container.id,
                    item.title.as_str(),
                    item.url.as_str(),
                    item.mime_type.as_str(),
                ))
                .add_contextf(format!("Failed to add {}", item.url))?;
            changed = true;
        }

        if changed {
            debug!("Online service {} now has {} items", name, wanted.len());
            self.updates
                .container_changed(container.id, FlushPolicy::Scheduled);
        }
        Ok(())
    }

    fn timer_fired(&self, key: &TimerKey) {
        match key {
            TimerKey::Autoscan(handle) => {
                let Some(adir) = self.timed.get(*handle) else {
                    debug!("Timer fired for retired autoscan {}", handle);
                    return;
                };
                if adir.lock().task_count() > 0 {
                    debug!("Autoscan {:?} is still scanning", adir.location());
                    return;
                }
                let location = adir.location();
                self.importer()
                    .submit_rescan(&adir, adir.object_id(), &location, true, NO_TASK);
            }
            TimerKey::OnlineService(name) => {
                let service = self
                    .services
                    .lock()
                    .iter()
                    .find(|service| service.name() == name)
                    .cloned();
                match service {
                    Some(service) => self.submit_fetch(service),
                    None => debug!("Timer fired for unknown online service {}", name),
                }
            }
            TimerKey::WatchRecheck => {
                if let Some(engine) = self.watcher.lock().as_ref() {
                    engine.recheck();
                }
            }
        }
    }

    fn submit_fetch(&self, service: Arc<dyn OnlineService>) {
        let description = format!("Updating: {}", service.name());
        self.tasks
            .add_task(Task::new(TaskKind::FetchOnlineContent { service }, description), true);
    }

    fn arm_service(&self, service: &Arc<dyn OnlineService>) {
        let key = TimerKey::OnlineService(service.name().to_string());
        if let Err(e) = self.timer.schedule(key, service.refresh_interval(), false) {
            warn!("Cannot schedule online service {}: {}", service.name(), e);
        }
        self.submit_fetch(service.clone());
    }

    /// Starts serving a listed entry: an immediate rescan for timed entries,
    /// watches for inotify ones.
    fn arm(&self, adir: &AutoscanRef) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        match adir.mode() {
            ScanMode::Timed => {
                let location = adir.location();
                self.importer()
                    .submit_rescan(adir, adir.object_id(), &location, true, NO_TASK);
            }
            ScanMode::INotify => {
                if let Some(engine) = self.watcher.lock().as_ref()
                    && let Err(e) = engine.monitor(adir)
                {
                    warn!("Cannot monitor {:?}: {}", adir.location(), e);
                }
            }
        }
    }

    /// Stops serving a listed entry.
    fn disarm(&self, adir: &AutoscanRef) {
        match adir.mode() {
            ScanMode::Timed => {
                if let Some(handle) = adir.scan_id() {
                    self.timer.cancel(&TimerKey::Autoscan(handle));
                }
            }
            ScanMode::INotify => self.unmonitor(adir),
        }
    }

    fn unmonitor(&self, adir: &AutoscanRef) {
        if let Some(engine) = self.watcher.lock().as_ref()
            && let Err(e) = engine.unmonitor(adir)
        {
            debug!("Watches of {:?} kept: {}", adir.location(), e);
        }
    }

    /// Stops serving an entry, unlists it and deletes its stored row.
    fn retire(&self, adir: &AutoscanRef) {
        self.disarm(adir);
        if let Some(handle) = adir.scan_id() {
            self.list_for(adir.mode()).remove(handle);
        }
        self.forget(adir);
    }

    fn forget(&self, adir: &AutoscanRef) {
        let storage_id = adir.lock().storage_id();
        if storage_id != INVALID_STORAGE_ID
            && let Err(e) = self.storage.remove_autoscan_directory(storage_id)
        {
            warn!("Cannot delete stored autoscan {:?}: {}", adir.location(), e);
        }
    }

    fn persist(&self, adir: &AutoscanRef) {
        let snapshot = adir.snapshot();
        if snapshot.storage_id() == INVALID_STORAGE_ID {
            return;
        }
        if let Err(e) = self.storage.update_autoscan_directory(&snapshot) {
            warn!("Cannot save autoscan {:?}: {}", snapshot.location(), e);
        }
    }

    /// Lists a loaded entry and stores it if it has no row yet.
    fn load_entry(&self, mut dir: AutoscanDirectory) -> Result<()> {
        if dir.mode() == ScanMode::INotify && !self.options.use_inotify {
            warn!(
                "Ignoring inotify autoscan {:?}: inotify is disabled",
                dir.location()
            );
            return Ok(());
        }

        let location = dir.location().to_path_buf();
        if self.lookup(&AutoscanKey::Location(location.clone())).is_some() {
            debug!("Autoscan {:?} is already listed", location);
            return Ok(());
        }
        if dir.storage_id() == INVALID_STORAGE_ID {
            let storage_id = self
                .storage
                .add_autoscan_directory(&dir)
                .add_contextf(format!("Failed to store autoscan {}", location.display()))?;
            dir.set_storage_id(storage_id);
        } else {
            self.storage
                .update_autoscan_directory(&dir)
                .add_contextf(format!("Failed to store autoscan {}", location.display()))?;
        }
        self.list_for(dir.mode())
            .add(dir)
            .add_contextf(format!("Failed to list autoscan {}", location.display()))?;
        Ok(())
    }

    fn resolve_location(&self, dir: &AutoscanDirectory) -> StdResult<PathBuf, ContentError> {
        let location = if dir.location().as_os_str().is_empty() {
            let object_id = dir.object_id();
            let object = self.storage.load_object(object_id)?;
            if !object.is_container() || object.location.as_os_str().is_empty() {
                return Err(ContentError::NotAContainer { id: object_id });
            }
            object.location
        } else {
            dir.location().to_path_buf()
        };
        normalize_path(&location).ok_or(ContentError::InvalidPath { path: location })
    }

    fn add_autoscan(
        &self,
        location: PathBuf,
        dir: &AutoscanDirectory,
    ) -> StdResult<AutoscanHandle, ContentError> {
        if !location.is_dir() {
            return Err(ContentError::PathNotFound { path: location });
        }

        let mut entry = AutoscanDirectory::new(location.clone(), dir.mode())
            .with_persistent(dir.persistent());
        entry.copy_settings_from(dir);
        entry.set_object_id(self.importer().ensure_path_existence(&location)?);
        let storage_id = self.storage.add_autoscan_directory(&entry)?;
        entry.set_storage_id(storage_id);

        let list = self.list_for(dir.mode());
        let handle = match list.add(entry) {
            Ok(handle) => handle,
            Err(e) => {
                self.storage.remove_autoscan_directory(storage_id)?;
                return Err(e.into());
            }
        };
        info!("Added {} autoscan {:?}", dir.mode().as_str(), location);
        if let Some(adir) = list.get(handle) {
            self.arm(&adir);
        }
        Ok(handle)
    }

    fn update_autoscan(
        &self,
        current: &AutoscanRef,
        dir: &AutoscanDirectory,
    ) -> StdResult<AutoscanHandle, ContentError> {
        let location = current.location();
        if current.persistent() {
            return Err(ContentError::PersistentAutoscan { location });
        }
        let Some(handle) = current.scan_id() else {
            return Err(ContentError::UnknownAutoscan);
        };

        self.disarm(current);
        let old_mode = current.mode();
        let new_mode = dir.mode();

        let adir = if old_mode == new_mode {
            current.lock().copy_settings_from(dir);
            current.clone()
        } else {
            let snapshot = current.snapshot();
            self.list_for(old_mode).remove(handle);
            let mut entry = AutoscanDirectory::new(location.clone(), new_mode);
            entry.copy_settings_from(dir);
            entry.set_object_id(snapshot.object_id());
            entry.set_storage_id(snapshot.storage_id());
            let moved = self.list_for(new_mode).add(entry)?;
            self.list_for(new_mode)
                .get(moved)
                .ok_or(ContentError::UnknownAutoscan)?
        };

        self.storage.update_autoscan_directory(&adir.snapshot())?;
        info!("Updated autoscan {:?} ({})", location, new_mode.as_str());
        self.arm(&adir);
        adir.scan_id().ok_or(ContentError::UnknownAutoscan)
    }
}
