//! Storage node of a sharded, replicated key-value store.
//!
//! A node serves the shards assigned to it by the cluster's coordination
//! store. Writes follow a two-phase protocol driven by a proxy: a prepare
//! locks the record and stages the change, and the matching commit, abort or
//! mark-delete completes it. When the cluster moves shards, the node either
//! streams its outgoing shards to their new owners while mirroring live
//! writes, or accepts the shards moving in.
//!
//! # Architecture
//!
//! ```text
//!        proxies / peer nodes
//!                 │
//!                 ▼
//! ┌─────────────────────────────────┐
//! │   NetworkServer (framed TCP)    │
//! └─────────────────────────────────┘
//!                 │
//!                 ▼
//! ┌─────────────────────────────────┐      ┌──────────────────────┐
//! │ RequestProcessor                │─────▶│ RedistContext        │
//! │  • LockTable                    │      │  • Manager           │
//! │  • prepare / commit / abort     │      │  • Replicator/shard  │
//! └─────────────────────────────────┘      │  • OutboundProcessor │
//!                 │                        └──────────────────────┘
//!                 ▼                                   ▲
//! ┌─────────────────────────────────┐                 │
//! │ Database (instance or prefix    │      ┌──────────────────────┐
//! │ sharding over KvEngine)         │◀─────│ Watcher              │
//! └─────────────────────────────────┘      │ (coordination store) │
//!                                          └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use shardkv::{InMemoryCoordStore, NodeConfig, StorageNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new(1, 0)
//!         .with_num_shards(16)
//!         .with_shards(0..16);
//!     let store = Arc::new(InMemoryCoordStore::new());
//!
//!     let node = StorageNode::start(config, store).await?;
//!     println!("listening on {}", node.local_addr());
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coord;
pub mod error;
pub mod network;
pub mod node;
pub mod processor;
pub mod redist;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{MicroShardConfig, NodeConfig, OutboundConfig, RedistConfig, ShardingKind};
pub use coord::{ClusterReader, CoordinationStore, InMemoryCoordStore, RedistTag};
pub use error::{Error, Result};
pub use node::StorageNode;
pub use processor::{LockTable, RequestContext, RequestProcessor};
pub use redist::{Manager, RateLimiter, RedistContext, Replicator, SnapshotStatus, Watcher};
pub use storage::{Database, Record};
pub use types::{NodeId, OpCode, OpStatus, OperationalMessage, RequestId, ShardId, ZoneId};
