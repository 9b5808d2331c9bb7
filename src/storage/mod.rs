//! Catalog storage collaborator.
//!
//! The autoscan core only talks to the catalog through the `Storage` trait.
//! Two implementations are provided: an in-memory catalog used by tests and
//! small deployments, and a SQLite catalog built on `sqlx`.

use std::{
    collections::HashSet,
    path::{Component, Path, PathBuf},
};

use crate::{autoscan::AutoscanDirectory, error::domain::CatalogError};

pub mod memory;
pub mod object;
pub mod schema;
pub mod sqlite;

pub use {
    memory::MemoryStorage,
    object::{CdsObject, FS_ROOT_ID, INVALID_OBJECT_ID, ObjectId, ObjectKind, ROOT_ID},
    sqlite::SqliteStorage,
};

/// Result of making sure a container chain exists for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsuredPath {
    /// Id of the container for the requested path.
    pub id: ObjectId,
    /// Container that gained a child, when anything had to be created.
    pub changed: Option<ObjectId>,
}

/// Catalog operations needed by the autoscan core.
///
/// Implementations synchronize internally; the worker, the watch engine and
/// the update coalescer call in from different threads.
pub trait Storage: Send + Sync {
    /// Loads one object.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::NotFound` if the id is unknown.
    fn load_object(&self, id: ObjectId) -> Result<CdsObject, CatalogError>;

    /// Finds the non-virtual object mirroring a filesystem path.
    fn find_object_by_path(&self, path: &Path) -> Result<Option<CdsObject>, CatalogError>;

    /// Stores a new object and returns its id.
    fn add_object(&self, object: CdsObject) -> Result<ObjectId, CatalogError>;

    /// Overwrites the stored fields of an existing object.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::NotFound` if `object.id` is unknown.
    fn update_object(&self, object: &CdsObject) -> Result<(), CatalogError>;

    /// Lists the direct children of a container.
    fn get_children(
        &self,
        parent: ObjectId,
        items_only: bool,
    ) -> Result<Vec<CdsObject>, CatalogError>;

    /// Removes an object with its whole subtree.
    ///
    /// With `all` set, other objects referring to the same file are removed
    /// too. Returns the containers whose child list changed.
    fn remove_object(&self, id: ObjectId, all: bool) -> Result<Vec<ObjectId>, CatalogError>;

    /// Persists an autoscan entry and returns its storage id.
    fn add_autoscan_directory(&self, dir: &AutoscanDirectory) -> Result<i64, CatalogError>;

    /// Updates a persisted autoscan entry.
    fn update_autoscan_directory(&self, dir: &AutoscanDirectory) -> Result<(), CatalogError>;

    /// Deletes a persisted autoscan entry.
    fn remove_autoscan_directory(&self, storage_id: i64) -> Result<(), CatalogError>;

    /// Loads every persisted autoscan entry.
    fn get_autoscan_directories(&self) -> Result<Vec<AutoscanDirectory>, CatalogError>;

    /// Bumps the update generation of every id and renders `id,gen,...`.
    ///
    /// Unknown ids are skipped. Pairs are ordered by id.
    fn increment_update_ids(&self, ids: &HashSet<ObjectId>) -> Result<String, CatalogError>;

    /// Returns the object id for a path, or `INVALID_OBJECT_ID`.
    fn find_object_id_by_path(&self, path: &Path) -> Result<ObjectId, CatalogError> {
        Ok(self
            .find_object_by_path(path)?
            .map_or(INVALID_OBJECT_ID, |object| object.id))
    }

    /// Removes several objects, skipping ids that are already gone.
    fn remove_objects(&self, ids: &[ObjectId], all: bool) -> Result<Vec<ObjectId>, CatalogError> {
        let mut changed = Vec::new();
        for &id in ids {
            match self.remove_object(id, all) {
                Ok(containers) => {
                    for container in containers {
                        if !changed.contains(&container) {
                            changed.push(container);
                        }
                    }
                }
                Err(CatalogError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        changed.retain(|id| !ids.contains(id));
        Ok(changed)
    }

    /// Creates the container chain mirroring `path` below the filesystem root.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::InvalidData` for relative paths or when a path
    /// component is already stored as an item.
    fn ensure_path_existence(&self, path: &Path) -> Result<EnsuredPath, CatalogError> {
        let mut parent = FS_ROOT_ID;
        let mut changed = None;
        let mut current = PathBuf::from("/");

        for component in path.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(name) => {
                    current.push(name);
                    match self.find_object_by_path(&current)? {
                        Some(object) if object.is_container() => parent = object.id,
                        Some(_) => {
                            return Err(CatalogError::InvalidData {
                                reason: format!("{} is not a container", current.display()),
                            });
                        }
                        None => {
                            let container =
                                CdsObject::container(parent, name.to_string_lossy(), &current);
                            let id = self.add_object(container)?;
                            changed.get_or_insert(parent);
                            parent = id;
                        }
                    }
                }
                _ => {
                    return Err(CatalogError::InvalidData {
                        reason: format!("path is not normalized: {}", path.display()),
                    });
                }
            }
        }

        Ok(EnsuredPath { id: parent, changed })
    }

    /// Creates a chain of virtual containers below the root container.
    fn add_container_chain(&self, titles: &[&str]) -> Result<EnsuredPath, CatalogError> {
        let mut parent = ROOT_ID;
        let mut changed = None;

        for title in titles {
            let existing = self
                .get_children(parent, false)?
                .into_iter()
                .find(|child| child.is_container() && child.title == *title);
            parent = match existing {
                Some(container) => container.id,
                None => {
                    let id = self.add_object(CdsObject::virtual_container(parent, *title))?;
                    changed.get_or_insert(parent);
                    id
                }
            };
        }

        Ok(EnsuredPath { id: parent, changed })
    }
}
