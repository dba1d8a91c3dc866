//! Record storage.
//!
//! - [`record`]: stored value layout
//! - [`record_key`]: storage key layout and shard hashing
//! - [`engine`]: ordered key-value engines
//! - [`sharding`]: shard-to-engine placement
//! - [`db`]: the storage context used by the request path

pub mod db;
pub mod engine;
pub mod record;
pub mod record_key;
#[cfg(feature = "rocksdb-storage")]
pub mod rocksdb_engine;
pub mod sharding;

pub use db::Database;
pub use engine::{EngineFactory, EngineSnapshot, KvEngine, MemoryEngine, MemoryEngineFactory, PROP_NUM_KEYS};
pub use record::Record;
pub use record_key::{shard_ids, KeyLayout, RecordKey};
#[cfg(feature = "rocksdb-storage")]
pub use rocksdb_engine::{RocksEngine, RocksEngineConfig, RocksEngineFactory};
pub use sharding::{InstanceSharding, PrefixSharding, Sharding};
