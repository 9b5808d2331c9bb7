//! SQLite catalog using `sqlx`.
//!
//! The autoscan core runs on plain OS threads, so `SqliteStorage` owns a
//! small tokio runtime and drives every query to completion with
//! `block_on`. It must not be called from inside another tokio runtime.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
};

use {
    serde_json::{from_str, to_string},
    sqlx::{Row, SqlitePool, sqlite::SqliteRow},
    tokio::runtime::{Builder, Runtime},
    tracing::debug,
};

use crate::{
    autoscan::{AutoscanDirectory, ScanLevel, ScanMode},
    error::domain::CatalogError,
    storage::{
        Storage,
        object::{CdsObject, ObjectId},
        schema::{SchemaManager, create_connection_pool},
    },
};

const OBJECT_COLUMNS: &str =
    "id, parent_id, object_type, title, location, url, mime_type, mtime, size, update_id, is_virtual";

/// Catalog persisted in a SQLite database.
pub struct SqliteStorage {
    pool: SqlitePool,
    runtime: Runtime,
}

impl SqliteStorage {
    /// Opens (and if needed creates) the catalog database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if the runtime cannot be started or the
    /// database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("catalog-db")
            .enable_all()
            .build()?;

        let pool = runtime.block_on(async {
            let pool = create_connection_pool(path).await?;
            SchemaManager::new(pool.clone()).initialize_schema().await?;
            Ok::<_, CatalogError>(pool)
        })?;

        debug!("Opened catalog database at {:?}", path);
        Ok(Self { pool, runtime })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        self.runtime.block_on(self.pool.close());
    }
}

fn object_from_row(row: &SqliteRow) -> Result<CdsObject, CatalogError> {
    let kind: String = row.try_get("object_type")?;
    let location: String = row.try_get("location")?;
    let mtime: i64 = row.try_get("mtime")?;
    let size: i64 = row.try_get("size")?;
    let update_id: i64 = row.try_get("update_id")?;

    Ok(CdsObject {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        kind: kind.parse()?,
        title: row.try_get("title")?,
        location: PathBuf::from(location),
        url: row.try_get("url")?,
        mime_type: row.try_get("mime_type")?,
        mtime: u64::try_from(mtime).unwrap_or_default(),
        size: u64::try_from(size).unwrap_or_default(),
        update_id: u32::try_from(update_id).unwrap_or_default(),
        is_virtual: row.try_get("is_virtual")?,
    })
}

fn autoscan_from_row(row: &SqliteRow) -> Result<AutoscanDirectory, CatalogError> {
    let location: String = row.try_get("location")?;
    let mode: String = row.try_get("scan_mode")?;
    let level: String = row.try_get("scan_level")?;
    let interval: i64 = row.try_get("interval")?;
    let watermarks: String = row.try_get("watermarks")?;

    let invalid = |reason: String| CatalogError::InvalidData { reason };
    let mode: ScanMode = mode.parse().map_err(|e| invalid(format!("{e}")))?;
    let level: ScanLevel = level.parse().map_err(|e| invalid(format!("{e}")))?;
    let watermarks: BTreeMap<PathBuf, u64> =
        from_str(&watermarks).map_err(|e| invalid(format!("bad watermarks: {e}")))?;

    let mut dir = AutoscanDirectory::new(location, mode)
        .with_level(level)
        .with_recursive(row.try_get("recursive")?)
        .with_hidden(row.try_get("hidden")?)
        .with_persistent(row.try_get("persistent")?)
        .with_interval(u32::try_from(interval).unwrap_or_default());
    dir.set_object_id(row.try_get("obj_id")?);
    dir.set_storage_id(row.try_get("id")?);
    dir.restore_watermarks(watermarks);
    Ok(dir)
}

fn watermarks_json(dir: &AutoscanDirectory) -> Result<String, CatalogError> {
    to_string(&dir.watermarks()).map_err(|e| CatalogError::InvalidData {
        reason: format!("cannot encode watermarks: {e}"),
    })
}

impl Storage for SqliteStorage {
    fn load_object(&self, id: ObjectId) -> Result<CdsObject, CatalogError> {
        self.block_on(async {
            let row = sqlx::query(&format!(
                "SELECT {OBJECT_COLUMNS} FROM cds_objects WHERE id = ?"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => object_from_row(&row),
                None => Err(CatalogError::NotFound { id }),
            }
        })
    }

    fn find_object_by_path(&self, path: &Path) -> Result<Option<CdsObject>, CatalogError> {
        let location = path.to_string_lossy().into_owned();
        self.block_on(async {
            let row = sqlx::query(&format!(
                "SELECT {OBJECT_COLUMNS} FROM cds_objects WHERE location = ? AND is_virtual = 0 LIMIT 1"
            ))
            .bind(location)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(object_from_row).transpose()
        })
    }

    fn add_object(&self, object: CdsObject) -> Result<ObjectId, CatalogError> {
        self.block_on(async {
            let parent_exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM cds_objects WHERE id = ?")
                    .bind(object.parent_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if parent_exists.is_none() {
                return Err(CatalogError::NotFound {
                    id: object.parent_id,
                });
            }

            let result = sqlx::query(
                r#"
                INSERT INTO cds_objects
                    (parent_id, object_type, title, location, url, mime_type, mtime, size, update_id, is_virtual)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(object.parent_id)
            .bind(object.kind.as_str())
            .bind(&object.title)
            .bind(object.location.to_string_lossy().into_owned())
            .bind(&object.url)
            .bind(&object.mime_type)
            .bind(i64::try_from(object.mtime).unwrap_or(i64::MAX))
            .bind(i64::try_from(object.size).unwrap_or(i64::MAX))
            .bind(i64::from(object.update_id))
            .bind(object.is_virtual)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
    }

    fn update_object(&self, object: &CdsObject) -> Result<(), CatalogError> {
        self.block_on(async {
            let result = sqlx::query(
                r#"
                UPDATE cds_objects
                SET parent_id = ?, title = ?, location = ?, url = ?, mime_type = ?, mtime = ?, size = ?
                WHERE id = ?
                "#,
            )
            .bind(object.parent_id)
            .bind(&object.title)
            .bind(object.location.to_string_lossy().into_owned())
            .bind(&object.url)
            .bind(&object.mime_type)
            .bind(i64::try_from(object.mtime).unwrap_or(i64::MAX))
            .bind(i64::try_from(object.size).unwrap_or(i64::MAX))
            .bind(object.id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound { id: object.id });
            }
            Ok(())
        })
    }

    fn get_children(
        &self,
        parent: ObjectId,
        items_only: bool,
    ) -> Result<Vec<CdsObject>, CatalogError> {
        let filter = if items_only {
            " AND object_type != 'container'"
        } else {
            ""
        };
        self.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {OBJECT_COLUMNS} FROM cds_objects WHERE parent_id = ?{filter} ORDER BY id"
            ))
            .bind(parent)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(object_from_row).collect()
        })
    }

    fn remove_object(&self, id: ObjectId, all: bool) -> Result<Vec<ObjectId>, CatalogError> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(&format!(
                "SELECT {OBJECT_COLUMNS} FROM cds_objects WHERE id = ?"
            ))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            let object = match row {
                Some(row) => object_from_row(&row)?,
                None => return Err(CatalogError::NotFound { id }),
            };

            let mut roots = vec![(object.id, object.parent_id)];
            if all && object.kind.is_item() && !object.location.as_os_str().is_empty() {
                let references =
                    sqlx::query("SELECT id, parent_id FROM cds_objects WHERE location = ? AND id != ?")
                        .bind(object.location.to_string_lossy().into_owned())
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?;
                for reference in references {
                    roots.push((reference.try_get("id")?, reference.try_get("parent_id")?));
                }
            }

            let mut removed: Vec<ObjectId> = Vec::new();
            for (root, _) in &roots {
                let subtree: Vec<i64> = sqlx::query_scalar(
                    r#"
                    WITH RECURSIVE subtree(id) AS (
                        SELECT ?
                        UNION ALL
                        SELECT c.id FROM cds_objects c JOIN subtree s ON c.parent_id = s.id
                    )
                    SELECT id FROM subtree
                    "#,
                )
                .bind(*root)
                .fetch_all(&mut *tx)
                .await?;
                removed.extend(subtree);
            }

            for removed_id in &removed {
                sqlx::query("DELETE FROM cds_objects WHERE id = ?")
                    .bind(*removed_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;

            let mut changed = Vec::new();
            for (_, parent) in roots {
                if !changed.contains(&parent) && !removed.contains(&parent) {
                    changed.push(parent);
                }
            }
            Ok(changed)
        })
    }

    fn add_autoscan_directory(&self, dir: &AutoscanDirectory) -> Result<i64, CatalogError> {
        let watermarks = watermarks_json(dir)?;
        self.block_on(async {
            let result = sqlx::query(
                r#"
                INSERT INTO autoscan
                    (location, obj_id, scan_mode, scan_level, recursive, hidden, persistent, interval, watermarks)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(dir.location().to_string_lossy().into_owned())
            .bind(dir.object_id())
            .bind(dir.mode().as_str())
            .bind(dir.level().as_str())
            .bind(dir.recursive())
            .bind(dir.hidden())
            .bind(dir.persistent())
            .bind(i64::from(dir.interval()))
            .bind(watermarks)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
    }

    fn update_autoscan_directory(&self, dir: &AutoscanDirectory) -> Result<(), CatalogError> {
        let watermarks = watermarks_json(dir)?;
        self.block_on(async {
            let result = sqlx::query(
                r#"
                UPDATE autoscan
                SET location = ?, obj_id = ?, scan_mode = ?, scan_level = ?, recursive = ?,
                    hidden = ?, persistent = ?, interval = ?, watermarks = ?
                WHERE id = ?
                "#,
            )
            .bind(dir.location().to_string_lossy().into_owned())
            .bind(dir.object_id())
            .bind(dir.mode().as_str())
            .bind(dir.level().as_str())
            .bind(dir.recursive())
            .bind(dir.hidden())
            .bind(dir.persistent())
            .bind(i64::from(dir.interval()))
            .bind(watermarks)
            .bind(dir.storage_id())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::InvalidData {
                    reason: format!("autoscan {} is not persisted", dir.storage_id()),
                });
            }
            Ok(())
        })
    }

    fn remove_autoscan_directory(&self, storage_id: i64) -> Result<(), CatalogError> {
        self.block_on(async {
            sqlx::query("DELETE FROM autoscan WHERE id = ?")
                .bind(storage_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn get_autoscan_directories(&self) -> Result<Vec<AutoscanDirectory>, CatalogError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT id, location, obj_id, scan_mode, scan_level, recursive, hidden,
                       persistent, interval, watermarks
                FROM autoscan
                ORDER BY id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(autoscan_from_row).collect()
        })
    }

    fn increment_update_ids(&self, ids: &HashSet<ObjectId>) -> Result<String, CatalogError> {
        let mut sorted: Vec<ObjectId> = ids.iter().copied().collect();
        sorted.sort_unstable();

        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            let mut pairs = Vec::new();
            for id in sorted {
                let result = sqlx::query("UPDATE cds_objects SET update_id = update_id + 1 WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 0 {
                    continue;
                }
                let generation: i64 = sqlx::query_scalar("SELECT update_id FROM cds_objects WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                pairs.push(format!("{id},{generation}"));
            }
            tx.commit().await?;
            Ok(pairs.join(","))
        })
    }
}
