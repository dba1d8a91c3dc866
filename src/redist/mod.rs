//! Shard redistribution.
//!
//! When the cluster moves shards between nodes, the source node streams a
//! snapshot of each outgoing shard to its new owner and mirrors live writes
//! while the snapshot runs. The pieces:
//!
//! - [`Replicator`]: per-shard forwarding with snapshot and realtime stats
//! - [`OutboundProcessor`]: prioritized queues toward one target node
//! - [`RateLimiter`]: byte-rate throttle for snapshot traffic
//! - [`Manager`]: runs snapshot passes over every outgoing shard
//! - [`RedistContext`]: the node's current role and manager
//! - [`Watcher`]: applies coordination commands and shard map updates

pub mod context;
pub mod manager;
pub mod outbound;
pub mod rate_limiter;
pub mod replicator;
pub mod snapshot;
pub mod stats;
pub mod watcher;

pub use context::RedistContext;
pub use manager::{Manager, SnapshotSource};
pub use outbound::{OutboundProcessor, ReplicationTarget, TargetConnector};
pub use rate_limiter::RateLimiter;
pub use replicator::Replicator;
pub use stats::{SnapshotStatus, Stats};
pub use watcher::Watcher;
