//! SQLite schema definition and versioning for the catalog.

use std::path::Path;

use {
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous},
    },
    thiserror::Error,
    tracing::debug,
};

/// Failures while opening or versioning the catalog database.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Catalog database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The file was written by a schema this build cannot read.
    #[error("Unsupported catalog schema version {found}")]
    UnsupportedVersion { found: i32 },
}

pub const SCHEMA_VERSION: i32 = 1;

/// Creates and versions the catalog tables.
pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the tables and the two root containers on a fresh file, or
    /// checks the version of an existing one.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError` on database failure or a foreign version.
    pub async fn initialize_schema(&self) -> Result<(), SchemaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        match self.stored_version().await? {
            None => {
                debug!("Creating catalog schema version {}", SCHEMA_VERSION);
                self.create_tables().await
            }
            Some(SCHEMA_VERSION) => Ok(()),
            Some(found) => Err(SchemaError::UnsupportedVersion { found }),
        }
    }

    async fn stored_version(&self) -> Result<Option<i32>, SchemaError> {
        Ok(sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn create_tables(&self) -> Result<(), SchemaError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE cds_objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER NOT NULL,
                object_type TEXT NOT NULL,
                title TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT '',
                url TEXT,
                mime_type TEXT,
                mtime INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                update_id INTEGER NOT NULL DEFAULT 0,
                is_virtual BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE autoscan (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location TEXT NOT NULL UNIQUE,
                obj_id INTEGER NOT NULL DEFAULT -1,
                scan_mode TEXT NOT NULL,
                scan_level TEXT NOT NULL,
                recursive BOOLEAN NOT NULL,
                hidden BOOLEAN NOT NULL,
                persistent BOOLEAN NOT NULL,
                interval INTEGER NOT NULL,
                watermarks TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cds_objects (id, parent_id, object_type, title, location)
            VALUES (0, -1, 'container', 'Root', ''),
                   (1, 0, 'container', 'PC Directory', '/')
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX idx_cds_objects_parent_id ON cds_objects (parent_id)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX idx_cds_objects_location ON cds_objects (location)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Creates a WAL-mode connection pool for the database file at `path`.
///
/// # Errors
///
/// Returns `SchemaError` if the database cannot be opened.
pub async fn create_connection_pool(path: &Path) -> Result<SqlitePool, SchemaError> {
    Ok(SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal),
    )
    .await?)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::storage::schema::{
        SCHEMA_VERSION, SchemaError, SchemaManager, create_connection_pool,
    };

    #[tokio::test]
    async fn test_initialize_creates_roots_once() {
        let dir = TempDir::new().unwrap();
        let pool = create_connection_pool(&dir.path().join("catalog.db"))
            .await
            .unwrap();
        let manager = SchemaManager::new(pool.clone());
        manager.initialize_schema().await.unwrap();
        manager.initialize_schema().await.unwrap();

        let roots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cds_objects WHERE id IN (0, 1)")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(roots, 2);
        assert_eq!(manager.stored_version().await.unwrap(), Some(SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn test_foreign_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = create_connection_pool(&dir.path().join("catalog.db"))
            .await
            .unwrap();
        let manager = SchemaManager::new(pool.clone());
        manager.initialize_schema().await.unwrap();
        sqlx::query("UPDATE schema_version SET version = 7")
            .execute(&pool)
            .await
            .unwrap();

        let err = manager.initialize_schema().await.unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedVersion { found: 7 }));
    }
}
