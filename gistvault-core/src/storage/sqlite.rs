//! SQLite-backed key-value store for desktop and CLI hosts.

use super::KeyValueStore;
use crate::{Result, VaultError};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe single-table store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(storage_err)?;
        Self::with_connection(conn)
    }

    /// Create a new in-memory store for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Storage("sqlite connection lock poisoned".to_string()))
    }
}

fn storage_err(e: rusqlite::Error) -> VaultError {
    VaultError::Storage(e.to_string())
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(storage_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM kv WHERE key = ?1", [key])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", "one").await.unwrap();
        store.set("k", "two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("account_1", "{}").await.unwrap();
            store.set("other", "x").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("account_1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(
            store.keys_with_prefix("account_").await.unwrap(),
            vec!["account_1".to_string()]
        );

        store.delete("account_1").await.unwrap();
        assert!(store.get("account_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_is_not_a_like_pattern() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("a_b", "1").await.unwrap();
        store.set("axb", "2").await.unwrap();
        assert_eq!(
            store.keys_with_prefix("a_").await.unwrap(),
            vec!["a_b".to_string()]
        );
    }
}
