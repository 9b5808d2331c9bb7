//! Filesystem import and rescan logic run by the content worker.

use std::{
    collections::HashSet,
    fs::{Metadata, metadata, read_dir, symlink_metadata},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use tracing::{debug, error, info, warn};

use crate::{
    autoscan::{AutoscanRef, ScanLevel, is_hidden_name},
    content::{
        queue::TaskQueue,
        task::{AutoscanSetting, CancellationToken, Task, TaskId, TaskKind},
    },
    error::domain::{CatalogError, ContentError},
    storage::{CdsObject, FS_ROOT_ID, INVALID_OBJECT_ID, ObjectId, ROOT_ID, Storage},
    update::{FlushPolicy, UpdateCoalescer},
};

/// MIME type used when the extension is unknown.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const MIME_TYPES: &[(&str, &str)] = &[
    ("aac", "audio/aac"),
    ("avi", "video/x-msvideo"),
    ("flac", "audio/flac"),
    ("gif", "image/gif"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("m4a", "audio/mp4"),
    ("m4v", "video/mp4"),
    ("mka", "audio/x-matroska"),
    ("mkv", "video/x-matroska"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("oga", "audio/ogg"),
    ("ogg", "audio/ogg"),
    ("ogv", "video/ogg"),
    ("opus", "audio/opus"),
    ("png", "image/png"),
    ("srt", "application/x-subrip"),
    ("ts", "video/mp2t"),
    ("wav", "audio/wav"),
    ("webm", "video/webm"),
    ("webp", "image/webp"),
    ("wma", "audio/x-ms-wma"),
    ("wmv", "video/x-ms-wmv"),
];

/// Looks up the MIME type of a file by its (case-insensitive) extension.
pub fn mime_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    MIME_TYPES
        .binary_search_by(|(known, _)| (*known).cmp(extension.as_str()))
        .ok()
        .map(|index| MIME_TYPES[index].1)
}

/// Modification time in whole seconds since the epoch; 0 if unknown.
pub fn mtime_of(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |age| age.as_secs())
}

/// How a rescan ended, for the content manager to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanOutcome {
    /// The directory was reconciled, or the scan was cancelled.
    Done,
    /// A persistent root is missing; the entry waits for it.
    RootMissing,
    /// A non-persistent root is gone; the entry must be retired.
    Retire,
}

/// Catalog mutations for one unit of import work.
pub struct Importer<'a> {
    storage: &'a dyn Storage,
    updates: &'a UpdateCoalescer,
    tasks: &'a TaskQueue,
    ignore_unknown_extensions: bool,
}

impl<'a> Importer<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        updates: &'a UpdateCoalescer,
        tasks: &'a TaskQueue,
        ignore_unknown_extensions: bool,
    ) -> Self {
        Self {
            storage,
            updates,
            tasks,
            ignore_unknown_extensions,
        }
    }

    fn notify(&self, changed: Option<ObjectId>) {
        if let Some(container) = changed {
            self.updates.container_changed(container, FlushPolicy::Scheduled);
        }
    }

    /// Makes sure the container chain for `path` exists.
    pub fn ensure_path_existence(&self, path: &Path) -> Result<ObjectId, CatalogError> {
        let ensured = self.storage.ensure_path_existence(path)?;
        self.notify(ensured.changed);
        Ok(ensured.id)
    }

    /// Finds or creates the catalog object for one path.
    ///
    /// Returns `None` for vanished paths, skipped symlinks, special files
    /// and files with unknown extensions when those are ignored.
    pub fn create_single_item(
        &self,
        path: &Path,
        follow_symlinks: bool,
    ) -> Result<Option<CdsObject>, ContentError> {
        let link = match symlink_metadata(path) {
            Ok(link) => link,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{:?} vanished before import", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if link.file_type().is_symlink() && !follow_symlinks {
            debug!("Skipping symlink {:?}", path);
            return Ok(None);
        }

        if let Some(existing) = self.storage.find_object_by_path(path)? {
            return self.refresh_item(existing, path).map(Some);
        }

        let metadata = match metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            let id = self.ensure_path_existence(path)?;
            return Ok(Some(self.storage.load_object(id)?));
        }
        if !metadata.is_file() {
            debug!("Skipping special file {:?}", path);
            return Ok(None);
        }

        let mime_type = match mime_type_for(path) {
            Some(mime_type) => mime_type,
            None if self.ignore_unknown_extensions => {
                debug!("Skipping {:?}: unknown extension", path);
                return Ok(None);
            }
            None => DEFAULT_MIME_TYPE,
        };

        let parent_path = path.parent().ok_or_else(|| ContentError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let parent_id = self.ensure_path_existence(parent_path)?;

        let mut item = CdsObject::item(
            parent_id,
            path,
            mime_type,
            mtime_of(&metadata),
            metadata.len(),
        );
        item.id = self.storage.add_object(item.clone())?;
        self.updates
            .container_changed(parent_id, FlushPolicy::Scheduled);
        debug!("Imported {:?} as {}", path, item.id);
        Ok(Some(item))
    }

    /// Brings size and modification time of an imported file up to date.
    ///
    /// A file created empty and written afterwards is imported on creation
    /// and seen again once the writer closes it.
    fn refresh_item(&self, mut item: CdsObject, path: &Path) -> Result<CdsObject, ContentError> {
        if !item.kind.is_pure_item() {
            return Ok(item);
        }
        let metadata = match metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(item),
            Err(e) => return Err(e.into()),
        };

        let (mtime, size) = (mtime_of(&metadata), metadata.len());
        if item.mtime == mtime && item.size == size {
            return Ok(item);
        }
        debug!(
            "Refreshing {:?}: size {} -> {}, mtime {} -> {}",
            path, item.size, size, item.mtime, mtime
        );
        item.mtime = mtime;
        item.size = size;
        self.storage.update_object(&item)?;
        self.updates
            .container_changed(item.parent_id, FlushPolicy::Scheduled);
        Ok(item)
    }

    /// Imports `path`, descending into directories when `setting` is
    /// recursive.
    ///
    /// Returns the object id, or `INVALID_OBJECT_ID` if the path was
    /// skipped.
    pub fn add_file(
        &self,
        path: &Path,
        setting: &AutoscanSetting,
        token: Option<&CancellationToken>,
    ) -> Result<ObjectId, ContentError> {
        if !setting.hidden && path.file_name().is_some_and(is_hidden_name) {
            debug!("Skipping hidden path {:?}", path);
            return Ok(INVALID_OBJECT_ID);
        }

        let Some(object) = self.create_single_item(path, setting.follow_symlinks)? else {
            return Ok(INVALID_OBJECT_ID);
        };

        if setting.recursive && object.is_container() {
            self.add_recursive(path, setting, token)?;
        }
        Ok(object.id)
    }

    /// Imports everything below `path`.
    ///
    /// The token is checked before each entry; a cancelled walk leaves the
    /// entries imported so far in place.
    pub fn add_recursive(
        &self,
        path: &Path,
        setting: &AutoscanSetting,
        token: Option<&CancellationToken>,
    ) -> Result<(), ContentError> {
        let entries = match read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let previous = setting
            .adir
            .as_ref()
            .map_or(0, |adir| adir.lock().previous_lmt(path));
        let mut newest = previous;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Cannot read entry of {:?}: {}", path, e);
                    continue;
                }
            };
            if !setting.hidden && is_hidden_name(&entry.file_name()) {
                continue;
            }
            if token.is_some_and(CancellationToken::is_cancelled) {
                debug!("Import below {:?} cancelled", path);
                break;
            }

            let child = entry.path();
            match self.create_single_item(&child, setting.follow_symlinks) {
                Ok(Some(object)) => {
                    let mtime = metadata(&child).map_or(0, |metadata| mtime_of(&metadata));
                    newest = newest.max(mtime);
                    if object.is_container()
                        && let Err(e) = self.add_recursive(&child, setting, token)
                    {
                        warn!("Skipping {:?}: {}", child, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping {:?}: {}", child, e),
            }
        }

        if let Some(adir) = &setting.adir {
            adir.lock().set_current_lmt(path, newest.max(1));
        }
        Ok(())
    }

    /// Removes an object and its subtree from the catalog.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::ProtectedObject` for the root containers.
    /// Objects that are already gone are skipped.
    pub fn remove_object(&self, object_id: ObjectId, all: bool) -> Result<(), ContentError> {
        if object_id == ROOT_ID || object_id == FS_ROOT_ID {
            return Err(ContentError::ProtectedObject { id: object_id });
        }

        match self.storage.remove_object(object_id, all) {
            Ok(changed) => {
                self.updates
                    .containers_changed(&changed, FlushPolicy::Scheduled);
                Ok(())
            }
            Err(CatalogError::NotFound { .. }) => {
                debug!("Object {} already removed", object_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queues a rescan of one container of `adir`.
    pub fn submit_rescan(
        &self,
        adir: &AutoscanRef,
        object_id: ObjectId,
        desc_path: &Path,
        cancellable: bool,
        parent: TaskId,
    ) -> TaskId {
        adir.lock().inc_task_count();
        let task = Task::new(
            TaskKind::RescanDirectory {
                adir: adir.clone(),
                object_id,
                desc_path: desc_path.to_path_buf(),
            },
            format!("Scan: {}", desc_path.display()),
        )
        .with_cancellable(cancellable)
        .with_parent(parent);
        self.tasks.add_task(task, true)
    }

    fn save_autoscan(&self, adir: &AutoscanRef, object_id: ObjectId) -> Result<(), CatalogError> {
        let snapshot = {
            let mut dir = adir.lock();
            dir.set_object_id(object_id);
            dir.clone()
        };
        self.storage.update_autoscan_directory(&snapshot)
    }

    /// Resolves the container a rescan works on.
    ///
    /// Returns the container id and its location, or the outcome that ends
    /// the rescan early.
    fn resolve_rescan_target(
        &self,
        adir: &AutoscanRef,
        object_id: ObjectId,
    ) -> Result<Result<(ObjectId, PathBuf), RescanOutcome>, ContentError> {
        let persistent = adir.persistent();

        if object_id != INVALID_OBJECT_ID {
            match self.storage.load_object(object_id) {
                Ok(object) if object.is_container() => {
                    let location = if object_id == FS_ROOT_ID {
                        PathBuf::from("/")
                    } else {
                        object.location
                    };
                    return Ok(Ok((object_id, location)));
                }
                Ok(_) | Err(CatalogError::NotFound { .. }) if !persistent => {
                    return Ok(Err(RescanOutcome::Retire));
                }
                Ok(_) | Err(CatalogError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let location = adir.location();
        if !location.is_dir() {
            self.save_autoscan(adir, INVALID_OBJECT_ID)?;
            return Ok(Err(if persistent {
                RescanOutcome::RootMissing
            } else {
                RescanOutcome::Retire
            }));
        }

        let container = self.ensure_path_existence(&location)?;
        self.save_autoscan(adir, container)?;
        Ok(Ok((container, location)))
    }

    /// Reconciles catalog container `object_id` with the directory it
    /// mirrors.
    ///
    /// New files are imported and vanished children removed. With
    /// `ScanLevel::Full`, files modified since the last completed scan are
    /// re-imported. Subdirectories already in the catalog get their own
    /// rescan task; new ones are imported by add tasks.
    pub fn rescan_directory(
        &self,
        adir: &AutoscanRef,
        object_id: ObjectId,
        task: &Task,
        follow_symlinks: bool,
    ) -> Result<RescanOutcome, ContentError> {
        let (container, location) = match self.resolve_rescan_target(adir, object_id)? {
            Ok(target) => target,
            Err(outcome) => return Ok(outcome),
        };
        if location.as_os_str().is_empty() {
            error!("Container {} has no location information", container);
            return Ok(RescanOutcome::Done);
        }

        debug!("Rescanning {:?}", location);
        let entries = match read_dir(&location) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not open {:?}: {}", location, e);
                self.remove_object(container, false)?;
                if adir.persistent() {
                    self.save_autoscan(adir, INVALID_OBJECT_ID)?;
                    return Ok(RescanOutcome::RootMissing);
                }
                return Ok(RescanOutcome::Retire);
            }
        };

        let (recursive, hidden, level, root) = {
            let dir = adir.lock();
            (dir.recursive(), dir.hidden(), dir.level(), dir.location().to_path_buf())
        };
        let mut vanished: HashSet<ObjectId> = self
            .storage
            .get_children(container, !recursive)?
            .into_iter()
            .map(|child| child.id)
            .collect();
        let previous = adir.lock().previous_lmt(&location);
        let mut newest = previous;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Cannot read entry of {:?}: {}", location, e);
                    continue;
                }
            };
            if !hidden && is_hidden_name(&entry.file_name()) {
                continue;
            }
            if task.is_cancelled() {
                debug!("Rescan of {:?} cancelled", location);
                break;
            }

            let child = entry.path();
            let metadata = match metadata(&child) {
                Ok(metadata) => metadata,
                Err(e) => {
                    error!("Failed to stat {:?}: {}", child, e);
                    continue;
                }
            };

            if adir.scan_id().is_none() {
                info!("Autoscan for {:?} was removed during the scan", location);
                adir.lock().set_current_lmt(&location, newest.max(1));
                return Ok(RescanOutcome::Done);
            }

            if !follow_symlinks && entry.file_type().is_ok_and(|file_type| file_type.is_symlink()) {
                let existing = self.storage.find_object_id_by_path(&child)?;
                if existing != INVALID_OBJECT_ID {
                    vanished.remove(&existing);
                    self.remove_object(existing, false)?;
                }
                debug!("Skipping symlink {:?}", child);
                continue;
            }

            let mtime = mtime_of(&metadata);
            let existing = self.storage.find_object_id_by_path(&child)?;
            if metadata.is_file() {
                let setting = AutoscanSetting {
                    adir: Some(adir.clone()),
                    recursive: false,
                    hidden,
                    follow_symlinks,
                };
                if existing != INVALID_OBJECT_ID {
                    vanished.remove(&existing);
                    if level == ScanLevel::Full && mtime > previous {
                        debug!("Re-importing modified file {:?}", child);
                        self.remove_object(existing, false)?;
                        self.import_entry(&child, &setting, task);
                        newest = newest.max(mtime);
                    }
                } else {
                    self.import_entry(&child, &setting, task);
                    newest = newest.max(mtime);
                }
            } else if metadata.is_dir() && recursive {
                newest = newest.max(mtime);
                if existing != INVALID_OBJECT_ID {
                    vanished.remove(&existing);
                    self.submit_rescan(adir, existing, &child, task.cancellable, task.id);
                } else {
                    let add = Task::new(
                        TaskKind::AddFile {
                            path: child.clone(),
                            root_path: root.clone(),
                            setting: AutoscanSetting {
                                adir: Some(adir.clone()),
                                recursive: true,
                                hidden,
                                follow_symlinks,
                            },
                        },
                        format!("Importing: {}", child.display()),
                    )
                    .with_parent(task.id)
                    .with_cancellable(task.cancellable);
                    self.tasks.add_task(add, true);
                }
            }
        }

        adir.lock().set_current_lmt(&location, newest.max(1));

        if task.is_cancelled() {
            return Ok(RescanOutcome::Done);
        }
        if !vanished.is_empty() {
            let ids: Vec<ObjectId> = vanished.into_iter().collect();
            debug!("Removing {} vanished objects below {:?}", ids.len(), location);
            let changed = self.storage.remove_objects(&ids, false)?;
            self.updates
                .containers_changed(&changed, FlushPolicy::Scheduled);
        }
        Ok(RescanOutcome::Done)
    }

    fn import_entry(&self, path: &Path, setting: &AutoscanSetting, task: &Task) {
        if let Err(e) = self.add_file(path, setting, Some(&task.token)) {
            warn!("Skipping {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{File, create_dir, create_dir_all, remove_file, write},
        path::{Path, PathBuf},
        sync::Arc,
        time::{Duration, SystemTime},
    };

    use tempfile::TempDir;

    use crate::{
        autoscan::{AutoscanDirectory, AutoscanList, AutoscanRef, ScanLevel, ScanMode},
        content::{
            import::{Importer, RescanOutcome, mime_type_for},
            queue::TaskQueue,
            task::{AutoscanSetting, CancellationToken, Task, TaskKind},
        },
        error::domain::{ContentError, UpdateError},
        storage::{FS_ROOT_ID, INVALID_OBJECT_ID, MemoryStorage, ROOT_ID, Storage},
        update::{LogSink, UpdateCoalescer},
    };

    struct Fixture {
        dir: TempDir,
        storage: Arc<MemoryStorage>,
        updates: UpdateCoalescer,
        tasks: TaskQueue,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let updates = UpdateCoalescer::new(
                storage.clone(),
                Arc::new(LogSink),
                Duration::from_millis(50),
                Arc::new(|_: &UpdateError| {}),
            );
            Self {
                dir: TempDir::new().unwrap(),
                storage,
                updates,
                tasks: TaskQueue::new(),
            }
        }

        fn importer(&self) -> Importer<'_> {
            Importer::new(self.storage.as_ref(), &self.updates, &self.tasks, false)
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.dir.path().join(relative)
        }

        fn touch(&self, relative: &str) -> PathBuf {
            let path = self.path(relative);
            File::create(&path).unwrap();
            path
        }
    }

    fn setting(adir: Option<&AutoscanRef>, recursive: bool, hidden: bool) -> AutoscanSetting {
        AutoscanSetting {
            adir: adir.cloned(),
            recursive,
            hidden,
            follow_symlinks: true,
        }
    }

    fn listed(list: &AutoscanList, dir: AutoscanDirectory) -> AutoscanRef {
        let handle = list.add(dir).unwrap();
        list.get(handle).unwrap()
    }

    fn persist(storage: &MemoryStorage, adir: &AutoscanRef) {
        let storage_id = storage.add_autoscan_directory(&adir.snapshot()).unwrap();
        adir.lock().set_storage_id(storage_id);
    }

    fn rescan_task(adir: &AutoscanRef, object_id: i64) -> Task {
        Task::new(
            TaskKind::RescanDirectory {
                adir: adir.clone(),
                object_id,
                desc_path: adir.location(),
            },
            "Scan",
        )
    }

    fn drain(tasks: &TaskQueue) -> Vec<Task> {
        let mut drained = Vec::new();
        while !tasks.is_empty() {
            if let Some(task) = tasks.pop_blocking() {
                drained.push(task);
            }
        }
        tasks.finish_current();
        drained
    }

    #[test]
    fn test_mime_lookup() {
        assert_eq!(mime_type_for(Path::new("/a/movie.MKV")), Some("video/x-matroska"));
        assert_eq!(mime_type_for(Path::new("/a/song.flac")), Some("audio/flac"));
        assert_eq!(mime_type_for(Path::new("/a/readme")), None);
        assert_eq!(mime_type_for(Path::new("/a/notes.xyz")), None);
    }

    #[test]
    fn test_add_file_refreshes_rewritten_item() {
        let f = Fixture::new();
        let song = f.touch("song.mp3");
        let importer = f.importer();

        let id = importer.add_file(&song, &setting(None, false, false), None).unwrap();
        assert_eq!(f.storage.load_object(id).unwrap().size, 0);

        write(&song, vec![7u8; 4096]).unwrap();
        let again = importer.add_file(&song, &setting(None, false, false), None).unwrap();
        assert_eq!(again, id);
        assert_eq!(f.storage.load_object(id).unwrap().size, 4096);
    }

    #[test]
    fn test_add_recursive_applies_hidden_rule() {
        let f = Fixture::new();
        create_dir_all(f.path("movies/.trash")).unwrap();
        f.touch("movies/a.mkv");
        f.touch("movies/.b.mkv");
        f.touch("movies/.trash/c.mkv");

        let importer = f.importer();
        let id = importer
            .add_file(&f.path("movies"), &setting(None, true, false), None)
            .unwrap();
        assert_ne!(id, INVALID_OBJECT_ID);

        let found = |relative: &str| {
            f.storage
                .find_object_id_by_path(&f.path(relative))
                .unwrap()
                != INVALID_OBJECT_ID
        };
        assert!(found("movies/a.mkv"));
        assert!(!found("movies/.b.mkv"));
        assert!(!found("movies/.trash"));

        importer
            .add_file(&f.path("movies"), &setting(None, true, true), None)
            .unwrap();
        assert!(found("movies/.b.mkv"));
        assert!(found("movies/.trash/c.mkv"));
    }

    #[test]
    fn test_add_file_is_idempotent_and_skips_hidden_leaf() {
        let f = Fixture::new();
        let file = f.touch("a.mp3");
        let hidden = f.touch(".b.mp3");
        let importer = f.importer();

        let first = importer.add_file(&file, &setting(None, false, false), None).unwrap();
        let second = importer.add_file(&file, &setting(None, false, false), None).unwrap();
        assert_eq!(first, second);
        let item = f.storage.load_object(first).unwrap();
        assert_eq!(item.mime_type.as_deref(), Some("audio/mpeg"));

        assert_eq!(
            importer.add_file(&hidden, &setting(None, false, false), None).unwrap(),
            INVALID_OBJECT_ID
        );
        assert_eq!(
            importer.add_file(&f.path("gone.mp3"), &setting(None, false, false), None).unwrap(),
            INVALID_OBJECT_ID
        );
    }

    #[test]
    fn test_cancelled_walk_stops_early() {
        let f = Fixture::new();
        create_dir(f.path("music")).unwrap();
        f.touch("music/a.mp3");
        let token = CancellationToken::new();
        token.cancel();

        f.importer()
            .add_file(&f.path("music"), &setting(None, true, false), Some(&token))
            .unwrap();
        assert_ne!(f.storage.find_object_id_by_path(&f.path("music")).unwrap(), INVALID_OBJECT_ID);
        assert_eq!(
            f.storage.find_object_id_by_path(&f.path("music/a.mp3")).unwrap(),
            INVALID_OBJECT_ID
        );
    }

    #[test]
    fn test_remove_object_protects_roots() {
        let f = Fixture::new();
        let importer = f.importer();
        assert!(matches!(
            importer.remove_object(ROOT_ID, false),
            Err(ContentError::ProtectedObject { id: ROOT_ID })
        ));
        assert!(matches!(
            importer.remove_object(FS_ROOT_ID, false),
            Err(ContentError::ProtectedObject { .. })
        ));
        assert!(importer.remove_object(12_345, false).is_ok());
    }

    #[test]
    fn test_rescan_adds_new_and_removes_vanished() {
        let f = Fixture::new();
        let root = f.path("movies");
        create_dir_all(root.join("old_season")).unwrap();
        let kept = f.touch("movies/kept.mkv");
        let dropped = f.touch("movies/dropped.mkv");

        let list = AutoscanList::new();
        let adir = listed(
            &list,
            AutoscanDirectory::new(root.clone(), ScanMode::Timed)
                .with_interval(60)
                .with_recursive(true),
        );
        persist(&f.storage, &adir);

        let importer = f.importer();
        importer.add_file(&root, &setting(Some(&adir), true, false), None).unwrap();
        let container = f.storage.find_object_id_by_path(&root).unwrap();
        let old_season = f.storage.find_object_id_by_path(&root.join("old_season")).unwrap();

        remove_file(&dropped).unwrap();
        f.touch("movies/new.mkv");
        create_dir(root.join("new_season")).unwrap();

        let outcome = importer
            .rescan_directory(&adir, container, &rescan_task(&adir, container), true)
            .unwrap();
        assert_eq!(outcome, RescanOutcome::Done);

        let id_of = |path: &Path| f.storage.find_object_id_by_path(path).unwrap();
        assert_ne!(id_of(&kept), INVALID_OBJECT_ID);
        assert_eq!(id_of(&dropped), INVALID_OBJECT_ID);
        assert_ne!(id_of(&root.join("new.mkv")), INVALID_OBJECT_ID);

        let queued = drain(&f.tasks);
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().any(|task| matches!(
            task.kind,
            TaskKind::RescanDirectory { object_id, .. } if object_id == old_season
        )));
        assert!(queued.iter().any(|task| matches!(
            &task.kind,
            TaskKind::AddFile { path, setting, .. } if *path == root.join("new_season") && setting.recursive
        )));
        assert_eq!(adir.lock().task_count(), 1);
    }

    #[test]
    fn test_full_rescan_reimports_modified_files() {
        let f = Fixture::new();
        let root = f.path("music");
        create_dir(&root).unwrap();
        let song = f.touch("music/song.flac");
        let old = SystemTime::now() - Duration::from_secs(3600);
        File::options().write(true).open(&song).unwrap().set_modified(old).unwrap();

        let list = AutoscanList::new();
        let adir = listed(
            &list,
            AutoscanDirectory::new(root.clone(), ScanMode::Timed)
                .with_interval(60)
                .with_level(ScanLevel::Full),
        );
        persist(&f.storage, &adir);
        let importer = f.importer();

        let first = importer
            .rescan_directory(&adir, INVALID_OBJECT_ID, &rescan_task(&adir, INVALID_OBJECT_ID), true)
            .unwrap();
        assert_eq!(first, RescanOutcome::Done);
        let container = adir.object_id();
        assert_ne!(container, INVALID_OBJECT_ID);
        let original = f.storage.find_object_id_by_path(&song).unwrap();
        adir.lock().update_lmt();

        importer
            .rescan_directory(&adir, container, &rescan_task(&adir, container), true)
            .unwrap();
        assert_eq!(f.storage.find_object_id_by_path(&song).unwrap(), original);

        File::options()
            .write(true)
            .open(&song)
            .unwrap()
            .set_modified(SystemTime::now())
            .unwrap();
        importer
            .rescan_directory(&adir, container, &rescan_task(&adir, container), true)
            .unwrap();
        let reimported = f.storage.find_object_id_by_path(&song).unwrap();
        assert_ne!(reimported, INVALID_OBJECT_ID);
        assert_ne!(reimported, original);
    }

    #[test]
    fn test_rescan_of_missing_root() {
        let f = Fixture::new();
        let list = AutoscanList::new();

        let persistent = listed(
            &list,
            AutoscanDirectory::new(f.path("gone"), ScanMode::Timed)
                .with_interval(60)
                .with_persistent(true),
        );
        persist(&f.storage, &persistent);
        let outcome = f
            .importer()
            .rescan_directory(
                &persistent,
                INVALID_OBJECT_ID,
                &rescan_task(&persistent, INVALID_OBJECT_ID),
                true,
            )
            .unwrap();
        assert_eq!(outcome, RescanOutcome::RootMissing);

        let transient = listed(
            &list,
            AutoscanDirectory::new(f.path("also_gone"), ScanMode::Timed).with_interval(60),
        );
        persist(&f.storage, &transient);
        let outcome = f
            .importer()
            .rescan_directory(
                &transient,
                INVALID_OBJECT_ID,
                &rescan_task(&transient, INVALID_OBJECT_ID),
                true,
            )
            .unwrap();
        assert_eq!(outcome, RescanOutcome::Retire);
    }
}
