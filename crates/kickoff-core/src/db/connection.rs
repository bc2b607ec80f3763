//! Database connection management

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::migrations::{self, Migration, LOCAL_MIGRATIONS};

/// Database handle shared by the cache and the mutation queue
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database wrapper for libSQL connections
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open the local cache database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, LOCAL_MIGRATIONS).await
    }

    /// Open a database file migrated to a custom schema
    pub async fn open_with(path: impl AsRef<Path>, schema: &[Migration]) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::initialize(db, schema, true).await
    }

    /// Open an in-memory local cache database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(LOCAL_MIGRATIONS).await
    }

    /// Open an in-memory database with a custom schema
    pub async fn open_in_memory_with(schema: &[Migration]) -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::initialize(db, schema, true).await
    }

    /// Connect to a remote libSQL server (e.g. Turso) and migrate it to `schema`
    pub async fn open_remote(url: &str, auth_token: &str, schema: &[Migration]) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::InvalidInput("Remote URL is required".into()));
        }
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await?;
        Self::initialize(db, schema, false).await
    }

    async fn initialize(db: LibSqlDatabase, schema: &[Migration], local: bool) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self { _db: db, conn };
        if local {
            database.configure().await?;
        }
        migrations::run(&database.conn, schema).await?;
        Ok(database)
    }

    /// Configure `SQLite` for optimal performance
    async fn configure(&self) -> Result<()> {
        // WAL lets other processes read while one writes
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA busy_timeout = 5000;", ())
            .await
            .ok();
        Ok(())
    }

    /// Wrap into the shared handle used by cache and queue
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rows = db.connection().query("SELECT 1", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i32>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("kickoff.db");
        Database::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_remote_rejects_empty_url() {
        let result = Database::open_remote("  ", "token", LOCAL_MIGRATIONS).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
