//! RocksDB-backed [`KvEngine`].
//!
//! Snapshots read in bounded batches; each batch sees a consistent view but
//! writes landing between batches may be observed.

#![cfg(feature = "rocksdb-storage")]

use crate::error::{Error, Result, StorageError};
use crate::storage::engine::{EngineFactory, EngineSnapshot, KvEngine, PROP_NUM_KEYS};
use bytes::Bytes;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const SNAPSHOT_BATCH: usize = 1024;

/// Configuration for a RocksDB engine.
#[derive(Debug, Clone)]
pub struct RocksEngineConfig {
    pub create_if_missing: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for RocksEngineConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_open_files: 1000,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

pub struct RocksEngine {
    db: Arc<DB>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksEngine").field("path", &self.path).finish()
    }
}

impl RocksEngine {
    pub fn open(path: impl AsRef<Path>, config: &RocksEngineConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);

        let db = DB::open(&opts, &path)?;
        info!(path = %path.display(), "Opened RocksDB engine");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }
}

impl KvEngine for RocksEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(key, value)?)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.db.get(key)?.map(Bytes::from))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.delete(key)?)
    }

    fn snapshot(&self) -> Result<Arc<dyn EngineSnapshot>> {
        Ok(Arc::new(RocksSnapshot {
            db: self.db.clone(),
        }))
    }

    fn compact_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<()> {
        let mut batch = WriteBatch::default();
        match end {
            Some(end) => batch.delete_range(start, end),
            None => {
                for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
                    let (k, _) = item?;
                    batch.delete(k);
                }
            }
        }
        self.db.write(batch)?;
        self.db.compact_range(Some(start), end);
        Ok(())
    }

    fn property(&self, name: &str) -> Option<String> {
        let name = if name == PROP_NUM_KEYS {
            "rocksdb.estimate-num-keys"
        } else {
            name
        };
        self.db.property_value(name).ok().flatten()
    }
}

struct RocksSnapshot {
    db: Arc<DB>,
}

impl EngineSnapshot for RocksSnapshot {
    fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> Box<dyn Iterator<Item = Result<(Bytes, Bytes)>> + Send + 'a> {
        Box::new(BatchCursor {
            db: &self.db,
            next_start: Some(start.to_vec()),
            skip_first: false,
            buf: VecDeque::new(),
        })
    }
}

struct BatchCursor<'a> {
    db: &'a DB,
    next_start: Option<Vec<u8>>,
    skip_first: bool,
    buf: VecDeque<Result<(Bytes, Bytes)>>,
}

impl BatchCursor<'_> {
    fn refill(&mut self) {
        let Some(start) = self.next_start.take() else {
            return;
        };
        let iter = self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward));
        let mut count = 0;
        for item in iter {
            match item {
                Ok((k, v)) => {
                    if self.skip_first && k.as_ref() == start.as_slice() {
                        continue;
                    }
                    count += 1;
                    if count == SNAPSHOT_BATCH {
                        self.next_start = Some(k.to_vec());
                    }
                    self.buf.push_back(Ok((Bytes::from(k.to_vec()), Bytes::from(v.to_vec()))));
                    if count == SNAPSHOT_BATCH {
                        break;
                    }
                }
                Err(e) => {
                    self.buf.push_back(Err(Error::from(e)));
                    break;
                }
            }
        }
        self.skip_first = true;
    }
}

impl Iterator for BatchCursor<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            self.refill();
        }
        self.buf.pop_front()
    }
}

/// Opens RocksDB engines under a base directory.
#[derive(Debug, Clone)]
pub struct RocksEngineFactory {
    base_dir: PathBuf,
    config: RocksEngineConfig,
}

impl RocksEngineFactory {
    pub fn new(base_dir: impl Into<PathBuf>, config: RocksEngineConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            config,
        }
    }
}

impl EngineFactory for RocksEngineFactory {
    fn open(&self, name: &str) -> Result<Arc<dyn KvEngine>> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let engine = RocksEngine::open(self.base_dir.join(name), &self.config)?;
        Ok(Arc::new(engine))
    }
}
