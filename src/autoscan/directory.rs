//! Autoscan directory value object and its shared handle.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    parking_lot::{Mutex, MutexGuard},
    serde::{Deserialize, Serialize},
};

use crate::{
    error::domain::AutoscanError,
    storage::{INVALID_OBJECT_ID, ObjectId},
};

/// Storage id of an autoscan entry that was never persisted.
pub const INVALID_STORAGE_ID: i64 = -1;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Detection strategy of an autoscan directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Periodic rescans driven by the rescan timer.
    Timed,
    /// Kernel filesystem notifications.
    INotify,
}

impl ScanMode {
    /// Configuration name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timed => "timed",
            Self::INotify => "inotify",
        }
    }
}

impl FromStr for ScanMode {
    type Err = AutoscanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timed" => Ok(Self::Timed),
            "inotify" => Ok(Self::INotify),
            other => Err(AutoscanError::UnknownMode {
                value: other.to_string(),
            }),
        }
    }
}

impl Display for ScanMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// What a timed rescan detects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanLevel {
    /// Additions and removals only.
    #[default]
    Basic,
    /// Additions, removals and modifications.
    Full,
}

impl ScanLevel {
    /// Configuration name of the level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Full => "full",
        }
    }
}

impl FromStr for ScanLevel {
    type Err = AutoscanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "full" => Ok(Self::Full),
            other => Err(AutoscanError::UnknownLevel {
                value: other.to_string(),
            }),
        }
    }
}

/// Opaque identity of a listed autoscan directory.
///
/// Handles are drawn from a process-wide counter and never reused, so a
/// handle stays meaningful after unrelated entries are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AutoscanHandle(u64);

impl AutoscanHandle {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging and external APIs.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for AutoscanHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Watermark {
    previous: u64,
    current: u64,
}

/// One configured watch root.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscanDirectory {
    location: PathBuf,
    mode: ScanMode,
    level: ScanLevel,
    recursive: bool,
    hidden: bool,
    persistent: bool,
    interval: u32,
    scan_id: Option<AutoscanHandle>,
    object_id: ObjectId,
    storage_id: i64,
    task_count: u32,
    watermarks: BTreeMap<PathBuf, Watermark>,
}

impl AutoscanDirectory {
    /// Creates a non-recursive, non-persistent entry at `location`.
    pub fn new(location: impl Into<PathBuf>, mode: ScanMode) -> Self {
        Self {
            location: location.into(),
            mode,
            level: ScanLevel::Basic,
            recursive: false,
            hidden: false,
            persistent: false,
            interval: 0,
            scan_id: None,
            object_id: INVALID_OBJECT_ID,
            storage_id: INVALID_STORAGE_ID,
            task_count: 0,
            watermarks: BTreeMap::new(),
        }
    }

    /// Creates an entry whose location is resolved later from `object_id`.
    pub fn for_object(object_id: ObjectId, mode: ScanMode) -> Self {
        let mut dir = Self::new(PathBuf::new(), mode);
        dir.object_id = object_id;
        dir
    }

    #[must_use]
    pub fn with_level(mut self, level: ScanLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    #[must_use]
    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    #[must_use]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Sets the location of an entry created without one.
    ///
    /// # Errors
    ///
    /// Returns `AutoscanError::LocationAlreadySet` if a location is present.
    pub fn set_location(&mut self, location: impl Into<PathBuf>) -> Result<(), AutoscanError> {
        if !self.location.as_os_str().is_empty() {
            return Err(AutoscanError::LocationAlreadySet {
                location: self.location.clone(),
            });
        }
        self.location = location.into();
        Ok(())
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ScanMode) {
        self.mode = mode;
    }

    pub fn level(&self) -> ScanLevel {
        self.level
    }

    pub fn set_level(&mut self, level: ScanLevel) {
        self.level = level;
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn set_recursive(&mut self, recursive: bool) {
        self.recursive = recursive;
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Interval between timed scans, in seconds.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval;
    }

    /// Handle assigned by the owning list; `None` once removed.
    pub fn scan_id(&self) -> Option<AutoscanHandle> {
        self.scan_id
    }

    pub(crate) fn set_scan_id(&mut self, scan_id: Option<AutoscanHandle>) {
        self.scan_id = scan_id;
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn set_object_id(&mut self, object_id: ObjectId) {
        self.object_id = object_id;
    }

    pub fn storage_id(&self) -> i64 {
        self.storage_id
    }

    pub fn set_storage_id(&mut self, storage_id: i64) {
        self.storage_id = storage_id;
    }

    /// Number of in-flight rescan tasks spawned for this entry.
    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    pub fn inc_task_count(&mut self) {
        self.task_count += 1;
    }

    /// Decrements the in-flight count and returns the new value.
    pub fn dec_task_count(&mut self) -> u32 {
        self.task_count = self.task_count.saturating_sub(1);
        self.task_count
    }

    /// Watermark trusted for modification checks below `location`.
    pub fn previous_lmt(&self, location: &Path) -> u64 {
        self.watermarks
            .get(location)
            .map_or(0, |watermark| watermark.previous)
    }

    /// Watermark collected by the scan in progress below `location`.
    pub fn current_lmt(&self, location: &Path) -> u64 {
        self.watermarks
            .get(location)
            .map_or(0, |watermark| watermark.current)
    }

    /// Raises the in-progress watermark of `location`; lower values are ignored.
    pub fn set_current_lmt(&mut self, location: &Path, mtime: u64) {
        let watermark = self.watermarks.entry(location.to_path_buf()).or_default();
        if mtime > watermark.current {
            watermark.current = mtime;
        }
    }

    /// Promotes the in-progress watermarks once the whole subtree is scanned.
    pub fn update_lmt(&mut self) {
        for watermark in self.watermarks.values_mut() {
            if watermark.current > 0 {
                watermark.previous = watermark.current;
                watermark.current = 0;
            }
        }
    }

    /// Forgets all watermarks; the next scan treats every file as modified.
    pub fn reset_lmt(&mut self) {
        self.watermarks.clear();
    }

    /// Trusted watermarks, for persistence.
    pub fn watermarks(&self) -> BTreeMap<PathBuf, u64> {
        self.watermarks
            .iter()
            .filter(|(_, watermark)| watermark.previous > 0)
            .map(|(location, watermark)| (location.clone(), watermark.previous))
            .collect()
    }

    /// Restores watermarks loaded from storage.
    pub fn restore_watermarks(&mut self, watermarks: BTreeMap<PathBuf, u64>) {
        self.watermarks = watermarks
            .into_iter()
            .map(|(location, previous)| {
                (
                    location,
                    Watermark {
                        previous,
                        current: 0,
                    },
                )
            })
            .collect();
    }

    /// Copies the user-editable settings of `other` into this entry.
    pub fn copy_settings_from(&mut self, other: &AutoscanDirectory) {
        self.hidden = other.hidden;
        self.recursive = other.recursive;
        self.interval = other.interval;
        self.level = other.level;
    }
}

/// Shared, live reference to a listed autoscan directory.
///
/// The list, the watch engine and running tasks all observe the same entry,
/// so a removal is visible to a scan already in progress.
#[derive(Debug, Clone)]
pub struct AutoscanRef(Arc<Mutex<AutoscanDirectory>>);

impl AutoscanRef {
    pub fn new(dir: AutoscanDirectory) -> Self {
        Self(Arc::new(Mutex::new(dir)))
    }

    pub fn lock(&self) -> MutexGuard<'_, AutoscanDirectory> {
        self.0.lock()
    }

    /// Copies the current state of the entry.
    pub fn snapshot(&self) -> AutoscanDirectory {
        self.0.lock().clone()
    }

    /// Returns `true` if both refer to the same entry.
    pub fn ptr_eq(&self, other: &AutoscanRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn location(&self) -> PathBuf {
        self.0.lock().location.clone()
    }

    pub fn mode(&self) -> ScanMode {
        self.0.lock().mode
    }

    pub fn recursive(&self) -> bool {
        self.0.lock().recursive
    }

    pub fn hidden(&self) -> bool {
        self.0.lock().hidden
    }

    pub fn persistent(&self) -> bool {
        self.0.lock().persistent
    }

    pub fn object_id(&self) -> ObjectId {
        self.0.lock().object_id
    }

    pub fn scan_id(&self) -> Option<AutoscanHandle> {
        self.0.lock().scan_id
    }
}

/// Returns `true` for dot-names other than `.` and `..`.
pub fn is_hidden_name(name: &OsStr) -> bool {
    let bytes = name.as_encoded_bytes();
    bytes.first() == Some(&b'.') && bytes != b"." && bytes != b".."
}

/// Lexically normalizes an absolute path.
///
/// Returns `None` for relative paths or paths escaping the root.
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => normalized.push(name),
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}
