//! Last-value store.
//!
//! Values live in an in-memory map and are written to a single table
//! `kv (key TEXT PRIMARY KEY, value TEXT)` by upsert. `put` never touches
//! disk; durability comes from `save_all` at graceful shutdown. The flush
//! runs in one transaction, so the table never holds a partial snapshot.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rusqlite::Connection;
use thiserror::Error;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create store directory: {0}")]
    CreateDir(#[source] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("key not found: {0}")]
    NotFound(String),
}

pub struct KvStore {
    conn: Mutex<Connection>,
    values: RwLock<HashMap<String, String>>,
    path: PathBuf,
}

impl KvStore {
    /// Open or create the store at `path`, creating parent directories as
    /// needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            values: RwLock::new(HashMap::new()),
            path,
        })
    }

    /// Read every row from the backing table into memory. Returns the
    /// number of keys loaded.
    pub fn load_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut values = self.values.write();
        let mut count = 0;
        for row in rows {
            let (key, value) = row?;
            values.insert(key, value);
            count += 1;
        }
        Ok(count)
    }

    /// Flush every in-memory pair to the backing table in one transaction.
    /// Returns the number of keys written; on error the table is unchanged.
    pub fn save_all(&self) -> Result<usize, StoreError> {
        let values = self.values.read();
        let mut conn = self.conn.lock();

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?;
            for (key, value) in values.iter() {
                stmt.execute([key.as_str(), value.as_str()])?;
            }
        }
        tx.commit()?;

        Ok(values.len())
    }

    /// Overwrite `key` in memory. Never fails.
    pub fn put(&self, key: &str, value: &str) {
        self.values
            .write()
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.values
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.values.read().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    pub fn keys_matching(&self, re: &Regex) -> Vec<String> {
        self.values
            .read()
            .keys()
            .filter(|key| re.is_match(key))
            .cloned()
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("path", &self.path)
            .field("keys", &self.values.read().len())
            .finish()
    }
}
