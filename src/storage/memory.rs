//! In-memory catalog.

use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use parking_lot::RwLock;

use crate::{
    autoscan::AutoscanDirectory,
    error::domain::CatalogError,
    storage::{
        Storage,
        object::{CdsObject, FS_ROOT_ID, ObjectId, ROOT_ID},
    },
};

#[derive(Debug)]
struct MemoryState {
    objects: BTreeMap<ObjectId, CdsObject>,
    next_id: ObjectId,
    autoscans: BTreeMap<i64, AutoscanDirectory>,
    next_autoscan_id: i64,
}

/// Catalog kept entirely in memory behind a read-write lock.
#[derive(Debug)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates a catalog holding only the root and filesystem-root containers.
    pub fn new() -> Self {
        let mut root = CdsObject::virtual_container(-1, "Root");
        root.id = ROOT_ID;
        let mut fs_root = CdsObject::container(ROOT_ID, "PC Directory", Path::new("/"));
        fs_root.id = FS_ROOT_ID;

        let objects = BTreeMap::from([(ROOT_ID, root), (FS_ROOT_ID, fs_root)]);
        Self {
            state: RwLock::new(MemoryState {
                objects,
                next_id: FS_ROOT_ID + 1,
                autoscans: BTreeMap::new(),
                next_autoscan_id: 1,
            }),
        }
    }

    /// Number of stored objects, roots included.
    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }
}

fn collect_subtree(objects: &BTreeMap<ObjectId, CdsObject>, id: ObjectId, out: &mut Vec<ObjectId>) {
    out.push(id);
    let children: Vec<ObjectId> = objects
        .values()
        .filter(|object| object.parent_id == id)
        .map(|object| object.id)
        .collect();
    for child in children {
        collect_subtree(objects, child, out);
    }
}

impl Storage for MemoryStorage {
    fn load_object(&self, id: ObjectId) -> Result<CdsObject, CatalogError> {
        self.state
            .read()
            .objects
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound { id })
    }

    fn find_object_by_path(&self, path: &Path) -> Result<Option<CdsObject>, CatalogError> {
        Ok(self
            .state
            .read()
            .objects
            .values()
            .find(|object| !object.is_virtual && object.location == path)
            .cloned())
    }

    fn add_object(&self, mut object: CdsObject) -> Result<ObjectId, CatalogError> {
        let mut state = self.state.write();
        if !state.objects.contains_key(&object.parent_id) {
            return Err(CatalogError::NotFound {
                id: object.parent_id,
            });
        }
        let id = state.next_id;
        state.next_id += 1;
        object.id = id;
        state.objects.insert(id, object);
        Ok(id)
    }

    fn update_object(&self, object: &CdsObject) -> Result<(), CatalogError> {
        let mut state = self.state.write();
        let stored = state
            .objects
            .get_mut(&object.id)
            .ok_or(CatalogError::NotFound { id: object.id })?;
        *stored = CdsObject {
            update_id: stored.update_id,
            ..object.clone()
        };
        Ok(())
    }

    fn get_children(
        &self,
        parent: ObjectId,
        items_only: bool,
    ) -> Result<Vec<CdsObject>, CatalogError> {
        Ok(self
            .state
            .read()
            .objects
            .values()
            .filter(|object| object.parent_id == parent)
            .filter(|object| !items_only || object.kind.is_item())
            .cloned()
            .collect())
    }

    fn remove_object(&self, id: ObjectId, all: bool) -> Result<Vec<ObjectId>, CatalogError> {
        let mut state = self.state.write();
        let object = state
            .objects
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound { id })?;

        let mut roots = vec![id];
        if all && object.kind.is_item() && !object.location.as_os_str().is_empty() {
            roots.extend(
                state
                    .objects
                    .values()
                    .filter(|other| other.id != id && other.location == object.location)
                    .map(|other| other.id),
            );
        }

        let mut removed = Vec::new();
        for root in &roots {
            collect_subtree(&state.objects, *root, &mut removed);
        }

        let mut changed = Vec::new();
        for root in &roots {
            if let Some(parent) = state.objects.get(root).map(|object| object.parent_id)
                && !changed.contains(&parent)
            {
                changed.push(parent);
            }
        }
        for removed_id in &removed {
            state.objects.remove(removed_id);
        }
        changed.retain(|parent| !removed.contains(parent));
        Ok(changed)
    }

    fn add_autoscan_directory(&self, dir: &AutoscanDirectory) -> Result<i64, CatalogError> {
        let mut state = self.state.write();
        let storage_id = state.next_autoscan_id;
        state.next_autoscan_id += 1;
        let mut stored = dir.clone();
        stored.set_storage_id(storage_id);
        state.autoscans.insert(storage_id, stored);
        Ok(storage_id)
    }

    fn update_autoscan_directory(&self, dir: &AutoscanDirectory) -> Result<(), CatalogError> {
        let mut state = self.state.write();
        match state.autoscans.get_mut(&dir.storage_id()) {
            Some(stored) => {
                *stored = dir.clone();
                Ok(())
            }
            None => Err(CatalogError::InvalidData {
                reason: format!("autoscan {} is not persisted", dir.storage_id()),
            }),
        }
    }

    fn remove_autoscan_directory(&self, storage_id: i64) -> Result<(), CatalogError> {
        self.state.write().autoscans.remove(&storage_id);
        Ok(())
    }

    fn get_autoscan_directories(&self) -> Result<Vec<AutoscanDirectory>, CatalogError> {
        Ok(self.state.read().autoscans.values().cloned().collect())
    }

    fn increment_update_ids(&self, ids: &HashSet<ObjectId>) -> Result<String, CatalogError> {
        let mut state = self.state.write();
        let mut sorted: Vec<ObjectId> = ids.iter().copied().collect();
        sorted.sort_unstable();

        let mut pairs = Vec::new();
        for id in sorted {
            if let Some(object) = state.objects.get_mut(&id) {
                object.update_id += 1;
                pairs.push(format!("{},{}", id, object.update_id));
            }
        }
        Ok(pairs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, path::Path};

    use crate::{
        autoscan::{AutoscanDirectory, ScanMode},
        storage::{
            MemoryStorage, Storage,
            object::{CdsObject, FS_ROOT_ID, INVALID_OBJECT_ID, ROOT_ID},
        },
    };

    #[test]
    fn test_update_object_keeps_generation() {
        let storage = MemoryStorage::new();
        let parent = storage.ensure_path_existence(Path::new("/media")).unwrap();
        let id = storage
            .add_object(CdsObject::item(parent.id, Path::new("/media/a.mp3"), "audio/mpeg", 1, 0))
            .unwrap();
        storage.increment_update_ids(&HashSet::from([id])).unwrap();

        let mut item = storage.load_object(id).unwrap();
        item.size = 10;
        item.update_id = 0;
        storage.update_object(&item).unwrap();

        let stored = storage.load_object(id).unwrap();
        assert_eq!(stored.size, 10);
        assert_eq!(stored.update_id, 1);
    }

    #[test]
    fn test_new_storage_has_roots() {
        let storage = MemoryStorage::new();
        assert!(storage.load_object(ROOT_ID).unwrap().is_container());
        assert_eq!(
            storage.find_object_id_by_path(Path::new("/")).unwrap(),
            FS_ROOT_ID
        );
        assert_eq!(
            storage.find_object_id_by_path(Path::new("/nope")).unwrap(),
            INVALID_OBJECT_ID
        );
    }

    #[test]
    fn test_ensure_path_existence_creates_chain_once() {
        let storage = MemoryStorage::new();
        let first = storage
            .ensure_path_existence(Path::new("/media/movies"))
            .unwrap();
        assert_eq!(first.changed, Some(FS_ROOT_ID));

        let media = storage.find_object_by_path(Path::new("/media")).unwrap().unwrap();
        assert_eq!(media.parent_id, FS_ROOT_ID);
        let movies = storage.load_object(first.id).unwrap();
        assert_eq!(movies.parent_id, media.id);
        assert_eq!(movies.title, "movies");

        let second = storage
            .ensure_path_existence(Path::new("/media/movies"))
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.changed, None);
    }

    #[test]
    fn test_remove_object_removes_subtree() {
        let storage = MemoryStorage::new();
        let dir = storage.ensure_path_existence(Path::new("/media")).unwrap();
        let item = storage
            .add_object(CdsObject::item(dir.id, Path::new("/media/a.mkv"), "video/x-matroska", 1, 1))
            .unwrap();

        let changed = storage.remove_object(dir.id, false).unwrap();
        assert_eq!(changed, vec![FS_ROOT_ID]);
        assert!(storage.load_object(item).is_err());
        assert_eq!(storage.object_count(), 2);
    }

    #[test]
    fn test_remove_all_removes_references() {
        let storage = MemoryStorage::new();
        let dir = storage.ensure_path_existence(Path::new("/media")).unwrap();
        let path = Path::new("/media/a.mp3");
        let item = storage
            .add_object(CdsObject::item(dir.id, path, "audio/mpeg", 1, 1))
            .unwrap();
        let mut reference = CdsObject::item(ROOT_ID, path, "audio/mpeg", 1, 1);
        reference.is_virtual = true;
        let reference = storage.add_object(reference).unwrap();

        storage.remove_object(item, true).unwrap();
        assert!(storage.load_object(reference).is_err());
    }

    #[test]
    fn test_increment_update_ids_renders_pairs() {
        let storage = MemoryStorage::new();
        let ids = HashSet::from([FS_ROOT_ID, ROOT_ID, 999]);
        assert_eq!(storage.increment_update_ids(&ids).unwrap(), "0,1,1,1");
        assert_eq!(
            storage
                .increment_update_ids(&HashSet::from([FS_ROOT_ID]))
                .unwrap(),
            "1,2"
        );
        assert_eq!(storage.increment_update_ids(&HashSet::new()).unwrap(), "");
    }

    #[test]
    fn test_autoscan_persistence() {
        let storage = MemoryStorage::new();
        let mut dir = AutoscanDirectory::new("/media", ScanMode::Timed).with_interval(30);
        let storage_id = storage.add_autoscan_directory(&dir).unwrap();
        dir.set_storage_id(storage_id);
        dir.set_object_id(5);
        storage.update_autoscan_directory(&dir).unwrap();

        let stored = storage.get_autoscan_directories().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].object_id(), 5);

        storage.remove_autoscan_directory(storage_id).unwrap();
        assert!(storage.get_autoscan_directories().unwrap().is_empty());
    }

    #[test]
    fn test_container_chain_is_virtual() {
        let storage = MemoryStorage::new();
        let chain = storage
            .add_container_chain(&["Online Services", "Podcasts"])
            .unwrap();
        let container = storage.load_object(chain.id).unwrap();
        assert!(container.is_virtual);
        assert_eq!(
            storage
                .add_container_chain(&["Online Services", "Podcasts"])
                .unwrap()
                .id,
            chain.id
        );
    }
}
