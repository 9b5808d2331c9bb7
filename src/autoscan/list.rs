//! Ordered collection of autoscan directories for one scan mode.

use std::{cell::RefCell, collections::HashMap, path::Path};

use {parking_lot::ReentrantMutex, tracing::debug};

use crate::{
    autoscan::directory::{AutoscanDirectory, AutoscanHandle, AutoscanRef},
    error::domain::AutoscanError,
    storage::ObjectId,
};

#[derive(Debug, Default)]
struct ListInner {
    entries: HashMap<AutoscanHandle, AutoscanRef>,
    order: Vec<AutoscanHandle>,
}

impl ListInner {
    fn find(&self, mut predicate: impl FnMut(&AutoscanDirectory) -> bool) -> Option<AutoscanHandle> {
        self.order
            .iter()
            .copied()
            .find(|handle| predicate(&self.entries[handle].lock()))
    }
}

/// Autoscan directories keyed by stable handle, iterated in insertion order.
///
/// The lock is re-entrant: bulk operations call back into single-entry
/// removal while already holding it. Callers receive shared refs or copies,
/// never a borrow of the list.
#[derive(Debug, Default)]
pub struct AutoscanList {
    inner: ReentrantMutex<RefCell<ListInner>>,
}

impl AutoscanList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry and assigns it a fresh handle.
    ///
    /// # Errors
    ///
    /// Returns `AutoscanError::DuplicateLocation` if the location is listed.
    pub fn add(&self, mut dir: AutoscanDirectory) -> Result<AutoscanHandle, AutoscanError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        if inner
            .find(|entry| entry.location() == dir.location())
            .is_some()
        {
            return Err(AutoscanError::DuplicateLocation {
                location: dir.location().to_path_buf(),
            });
        }

        let handle = AutoscanHandle::next();
        dir.set_scan_id(Some(handle));
        debug!("Adding autoscan {} at {:?}", handle, dir.location());
        inner.entries.insert(handle, AutoscanRef::new(dir));
        inner.order.push(handle);
        Ok(handle)
    }

    /// Returns the entry with the given handle.
    pub fn get(&self, handle: AutoscanHandle) -> Option<AutoscanRef> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.entries.get(&handle).cloned()
    }

    /// Returns the entry watching `location`.
    pub fn get_by_location(&self, location: &Path) -> Option<AutoscanRef> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .find(|entry| entry.location() == location)
            .map(|handle| inner.entries[&handle].clone())
    }

    /// Returns the entry imported as catalog container `object_id`.
    pub fn get_by_object_id(&self, object_id: ObjectId) -> Option<AutoscanRef> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .find(|entry| entry.object_id() == object_id)
            .map(|handle| inner.entries[&handle].clone())
    }

    /// Returns the entry with the longest location that contains `path`.
    pub fn find_containing(&self, path: &Path) -> Option<AutoscanRef> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .order
            .iter()
            .map(|handle| &inner.entries[handle])
            .filter(|entry| path.starts_with(entry.lock().location()))
            .max_by_key(|entry| entry.lock().location().as_os_str().len())
            .cloned()
    }

    /// Removes an entry and invalidates its handle.
    pub fn remove(&self, handle: AutoscanHandle) -> Option<AutoscanRef> {
        let guard = self.inner.lock();
        let removed = {
            let mut inner = guard.borrow_mut();
            inner.order.retain(|listed| *listed != handle);
            inner.entries.remove(&handle)
        };
        if let Some(entry) = &removed {
            debug!("Removing autoscan {} at {:?}", handle, entry.lock().location());
            entry.lock().set_scan_id(None);
        }
        removed
    }

    /// Removes the entry watching `location`.
    pub fn remove_by_location(&self, location: &Path) -> Option<AutoscanRef> {
        let _guard = self.inner.lock();
        let handle = self.get_by_location(location)?.scan_id()?;
        self.remove(handle)
    }

    /// Removes the entry imported as catalog container `object_id`.
    pub fn remove_by_object_id(&self, object_id: ObjectId) -> Option<AutoscanRef> {
        let _guard = self.inner.lock();
        let handle = self.get_by_object_id(object_id)?.scan_id()?;
        self.remove(handle)
    }

    /// Retires every entry located at or below `parent`.
    ///
    /// Persistent entries are kept unless `include_persistent` is set.
    /// Returns the retired entries; their handles are invalidated.
    pub fn remove_if_subdir(&self, parent: &Path, include_persistent: bool) -> Vec<AutoscanRef> {
        let guard = self.inner.lock();
        let matches: Vec<AutoscanHandle> = {
            let inner = guard.borrow();
            inner
                .order
                .iter()
                .copied()
                .filter(|handle| {
                    let dir = inner.entries[handle].lock();
                    dir.location().starts_with(parent) && (include_persistent || !dir.persistent())
                })
                .collect()
        };

        matches
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }

    /// Shared refs to all entries in insertion order.
    pub fn snapshot(&self) -> Vec<AutoscanRef> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .order
            .iter()
            .map(|handle| inner.entries[handle].clone())
            .collect()
    }

    /// Copies of all entries in insertion order.
    pub fn copies(&self) -> Vec<AutoscanDirectory> {
        self.snapshot().iter().map(AutoscanRef::snapshot).collect()
    }

    /// Number of listed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().borrow().order.len()
    }

    /// Returns `true` if nothing is listed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
