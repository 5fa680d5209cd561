//! RocksDB wrapper exposing the node's ordered key-value contract
//!
//! This module provides a high-level interface to RocksDB with the operations
//! the snapshot machinery depends on: point reads that distinguish "absent"
//! from failure, atomic write batches, closure-based update transactions with
//! read-your-writes semantics, bounded prefix scans, and prefix drops.

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{DbEntry, Result, StoreError};

/// Number of keys deleted per batch while dropping a prefix.
const DROP_PREFIX_BATCH: usize = 1024;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Enable compression (LZ4)
    pub enable_compression: bool,
    /// Maximum number of open files
    pub max_open_files: i32,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/meridian"),
            enable_compression: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Write batch for atomic multi-record commits
pub struct WriteBatch {
    inner: rocksdb::WriteBatch,
}

impl WriteBatch {
    /// Create a new write batch
    pub fn new() -> Self {
        Self {
            inner: rocksdb::WriteBatch::default(),
        }
    }

    /// Stage a key-value pair
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.inner.put(key, value);
    }

    /// Stage a deletion
    pub fn delete(&mut self, key: &[u8]) {
        self.inner.delete(key);
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-your-writes transaction handed to [`Database::update`] closures.
///
/// Writes are staged in memory and become visible to subsequent `get` calls
/// on the same transaction; nothing touches the database until the closure
/// returns successfully, at which point the staged set commits atomically.
pub struct UpdateTxn<'a> {
    db: &'a Database,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl UpdateTxn<'_> {
    /// Read a key, observing writes staged earlier in this transaction.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        self.db.get_opt(key)
    }

    /// Stage a key-value pair.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.staged.insert(key.to_vec(), Some(value.to_vec()));
    }

    /// Stage a deletion.
    pub fn delete(&mut self, key: &[u8]) {
        self.staged.insert(key.to_vec(), None);
    }
}

/// RocksDB wrapper
pub struct Database {
    inner: DB,
    config: DatabaseConfig,
    /// Lock for coordinating writes
    write_lock: Mutex<()>,
}

impl Database {
    /// Open or create a database at the configured path
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        info!("opening database at {}", config.path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        if config.enable_compression {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let db = DB::open(&opts, &config.path).map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            inner: db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Open a database with default configuration at `path`
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(DatabaseConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    /// Get a value, failing with [`StoreError::KeyNotFound`] when absent
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_opt(key)?.ok_or(StoreError::KeyNotFound)
    }

    /// Get a value, `None` when absent
    pub fn get_opt(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner
            .get(key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Put a single key-value pair
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.inner
            .put(key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Delete a single key
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.inner
            .delete(key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Execute a write batch atomically
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.inner
            .write(batch.inner)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Run a read-your-writes transaction.
    ///
    /// The closure's staged writes commit atomically when it returns `Ok`;
    /// on error nothing is applied.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut UpdateTxn<'_>) -> Result<()>,
    {
        let mut txn = UpdateTxn {
            db: self,
            staged: BTreeMap::new(),
        };
        f(&mut txn)?;

        let mut batch = WriteBatch::new();
        for (key, value) in &txn.staged {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        self.write(batch)
    }

    /// Scan up to `limit` entries under `prefix`, starting at `start_key`.
    ///
    /// Entries come back in ascending byte order beginning at
    /// `max(start_key, prefix)`. The returned bool is `full`: the limit was
    /// reached and more entries may remain.
    pub fn iterate_prefix(
        &self,
        prefix: &[u8],
        start_key: &[u8],
        limit: usize,
    ) -> Result<(Vec<DbEntry>, bool)> {
        if limit == 0 {
            return Ok((Vec::new(), false));
        }
        let start: &[u8] = if start_key >= prefix { start_key } else { prefix };

        let mut entries = Vec::new();
        let mut full = false;
        for item in self
            .inner
            .iterator(IteratorMode::From(start, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push(DbEntry::new(key.into_vec(), value.into_vec()));
            if entries.len() == limit {
                full = true;
                break;
            }
        }
        Ok((entries, full))
    }

    /// Delete every key under `prefix`.
    ///
    /// Works in bounded batches so unrelated reads and writes keep flowing
    /// while a large prefix is being retired.
    pub fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut dropped = 0usize;
        loop {
            let (entries, more) = self.iterate_prefix(prefix, prefix, DROP_PREFIX_BATCH)?;
            if entries.is_empty() {
                break;
            }
            let mut batch = WriteBatch::new();
            for entry in &entries {
                batch.delete(&entry.key);
            }
            dropped += entries.len();
            self.write(batch)?;
            if !more {
                break;
            }
        }
        debug!(dropped, "dropped keys under prefix 0x{}", hex::encode(prefix));
        Ok(())
    }

    /// Get the path to the database
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        debug!("closing database at {}", self.config.path.display());
        // RocksDB handles cleanup automatically
    }
}
