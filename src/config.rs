//! Configuration types for the storage node.

use crate::error::{Error, Result};
use crate::types::{NodeId, ShardId, ZoneId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default micro-shard count when micro-sharding is enabled without a count.
pub const DEFAULT_NUM_MICRO_SHARDS: u32 = 256;

/// Default micro-shard group count when micro-sharding is enabled without a count.
pub const DEFAULT_NUM_MICRO_SHARD_GROUPS: u32 = 8;

/// Main configuration for a storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Zone this node lives in.
    pub zone_id: ZoneId,

    /// Node identifier within the zone.
    pub node_id: NodeId,

    /// Address the request listener binds to.
    pub listen_addr: SocketAddr,

    /// Total number of shards in the cluster.
    pub num_shards: u32,

    /// Shards initially owned by this node.
    pub shards: Vec<ShardId>,

    /// How shards are laid out across storage engines.
    pub sharding: ShardingKind,

    /// Number of physical stores for prefix sharding.
    pub num_dbs: u32,

    /// Micro-shard layout.
    pub micro_shards: MicroShardConfig,

    /// How long a prepare holds its record lock waiting for phase two.
    pub rec_lock_expiration: Duration,

    /// Reject requests whose declared shard does not match the key hash.
    pub validate_shard_id: bool,

    /// Grace period before a replaced storage handle is shut down.
    pub storage_swap_grace: Duration,

    /// Delay before applying a new shard map version.
    pub shard_map_update_delay: Duration,

    /// Maximum number of idle prepare holders kept for reuse.
    pub holder_pool_size: usize,

    /// Directory for on-disk engines.
    pub data_dir: Option<PathBuf>,

    /// Redistribution settings.
    pub redist: RedistConfig,
}

/// Storage layout strategy, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingKind {
    /// One engine instance per owned shard.
    ByInstance,
    /// A fixed set of engines, keys carry the shard prefix.
    ByPrefix,
}

/// Micro-shard settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroShardConfig {
    pub enabled: bool,
    pub num_micro_shards: u32,
    pub num_micro_shard_groups: u32,
}

impl Default for MicroShardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_micro_shards: 0,
            num_micro_shard_groups: 0,
        }
    }
}

impl MicroShardConfig {
    /// Micro-sharding with the given counts.
    pub fn enabled(num_micro_shards: u32, num_micro_shard_groups: u32) -> Self {
        Self {
            enabled: true,
            num_micro_shards,
            num_micro_shard_groups,
        }
        .normalized()
    }

    /// Fill in defaults for out-of-range counts, or zero them when disabled.
    pub fn normalized(mut self) -> Self {
        if self.enabled {
            if self.num_micro_shard_groups == 0 || self.num_micro_shard_groups > 256 {
                self.num_micro_shard_groups = DEFAULT_NUM_MICRO_SHARD_GROUPS;
            }
            if self.num_micro_shards == 0 || self.num_micro_shards > 256 {
                self.num_micro_shards = DEFAULT_NUM_MICRO_SHARDS;
            }
        } else {
            self.num_micro_shards = 0;
            self.num_micro_shard_groups = 0;
        }
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            zone_id: 0,
            node_id: 0,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 25000)),
            num_shards: 1024,
            shards: Vec::new(),
            sharding: ShardingKind::ByPrefix,
            num_dbs: 1,
            micro_shards: MicroShardConfig::default(),
            rec_lock_expiration: Duration::from_millis(600),
            validate_shard_id: true,
            storage_swap_grace: Duration::from_secs(1),
            shard_map_update_delay: Duration::from_secs(30),
            holder_pool_size: 10_000,
            data_dir: None,
            redist: RedistConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for the given zone and node.
    pub fn new(zone_id: ZoneId, node_id: NodeId) -> Self {
        Self {
            zone_id,
            node_id,
            ..Default::default()
        }
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the cluster-wide shard count.
    pub fn with_num_shards(mut self, num_shards: u32) -> Self {
        self.num_shards = num_shards;
        self
    }

    /// Set the shards owned at startup.
    pub fn with_shards(mut self, shards: impl IntoIterator<Item = ShardId>) -> Self {
        self.shards = shards.into_iter().collect();
        self
    }

    /// Set the sharding strategy.
    pub fn with_sharding(mut self, sharding: ShardingKind) -> Self {
        self.sharding = sharding;
        self
    }

    /// Set the number of prefix-sharded stores.
    pub fn with_num_dbs(mut self, num_dbs: u32) -> Self {
        self.num_dbs = num_dbs;
        self
    }

    /// Set the micro-shard layout.
    pub fn with_micro_shards(mut self, micro: MicroShardConfig) -> Self {
        self.micro_shards = micro.normalized();
        self
    }

    /// Set the record lock expiration.
    pub fn with_rec_lock_expiration(mut self, expiration: Duration) -> Self {
        self.rec_lock_expiration = expiration;
        self
    }

    /// Enable or disable shard id validation.
    pub fn with_validate_shard_id(mut self, validate: bool) -> Self {
        self.validate_shard_id = validate;
        self
    }

    /// Set the grace period for retired storage handles.
    pub fn with_storage_swap_grace(mut self, grace: Duration) -> Self {
        self.storage_swap_grace = grace;
        self
    }

    /// Set the shard map update delay.
    pub fn with_shard_map_update_delay(mut self, delay: Duration) -> Self {
        self.shard_map_update_delay = delay;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the redistribution configuration.
    pub fn with_redist_config(mut self, redist: RedistConfig) -> Self {
        self.redist = redist;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 || self.num_shards > u16::MAX as u32 + 1 {
            return Err(Error::Config(format!(
                "num_shards must be in 1..=65536, got {}",
                self.num_shards
            )));
        }
        if self.sharding == ShardingKind::ByPrefix && self.num_dbs == 0 {
            return Err(Error::Config("num_dbs must be positive".to_string()));
        }
        if let Some(s) = self.shards.iter().find(|s| **s as u32 >= self.num_shards) {
            return Err(Error::Config(format!("shard {} out of range", s)));
        }
        let micro = &self.micro_shards;
        if micro.enabled {
            if micro.num_micro_shards > 256 {
                return Err(Error::Config("num_micro_shards must be <= 256".to_string()));
            }
            if micro.num_micro_shard_groups > micro.num_micro_shards {
                return Err(Error::Config(
                    "num_micro_shard_groups must not exceed num_micro_shards".to_string(),
                ));
            }
        }
        self.redist.validate()
    }
}

/// Redistribution configuration.
#[derive(Debug, Clone)]
pub struct RedistConfig {
    /// Snapshot forwarding throttle in KB per second.
    pub snapshot_rate_limit_kbps: u64,

    /// How long a queued replication request may wait for dispatch.
    pub resp_timeout: Duration,

    /// Upper bound for busy-retry and drain waits.
    pub max_wait_time: Duration,

    /// Retries allowed per forwarded message.
    pub max_retry: u16,

    /// Snapshot error percentage that aborts a shard.
    pub err_threshold: f64,

    /// Snapshot drop percentage that aborts a shard.
    pub drop_threshold: f64,

    /// Realtime error percentage that aborts a shard.
    pub err_threshold_realtime: f64,

    /// Realtime drop percentage that aborts a shard.
    pub drop_threshold_realtime: f64,

    /// Pause before the first redistribution pass.
    pub start_delay: Duration,

    /// Number of passes over all shards before giving up.
    pub max_rounds: u32,

    /// Outbound connection settings.
    pub outbound: OutboundConfig,
}

impl Default for RedistConfig {
    fn default() -> Self {
        Self {
            snapshot_rate_limit_kbps: 10_000,
            resp_timeout: Duration::from_secs(5),
            max_wait_time: Duration::from_secs(180),
            max_retry: 3,
            err_threshold: 0.01,
            drop_threshold: 0.0,
            err_threshold_realtime: 0.01,
            drop_threshold_realtime: 0.0,
            start_delay: Duration::from_secs(1),
            max_rounds: 5,
            outbound: OutboundConfig::default(),
        }
    }
}

impl RedistConfig {
    /// Set the snapshot rate limit in KB per second.
    pub fn with_snapshot_rate_limit_kbps(mut self, kbps: u64) -> Self {
        self.snapshot_rate_limit_kbps = kbps;
        self
    }

    /// Set the max retry count.
    pub fn with_max_retry(mut self, max_retry: u16) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the max wait time.
    pub fn with_max_wait_time(mut self, wait: Duration) -> Self {
        self.max_wait_time = wait;
        self
    }

    /// Set the response timeout.
    pub fn with_resp_timeout(mut self, timeout: Duration) -> Self {
        self.resp_timeout = timeout;
        self
    }

    /// Set snapshot thresholds as (drop pct, err pct).
    pub fn with_snapshot_thresholds(mut self, drop_pct: f64, err_pct: f64) -> Self {
        self.drop_threshold = drop_pct;
        self.err_threshold = err_pct;
        self
    }

    /// Set realtime thresholds as (drop pct, err pct).
    pub fn with_realtime_thresholds(mut self, drop_pct: f64, err_pct: f64) -> Self {
        self.drop_threshold_realtime = drop_pct;
        self.err_threshold_realtime = err_pct;
        self
    }

    /// Set the delay before the first pass.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Set the outbound configuration.
    pub fn with_outbound(mut self, outbound: OutboundConfig) -> Self {
        self.outbound = outbound;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.outbound.queue_size == 0 {
            return Err(Error::Config("outbound queue_size must be positive".to_string()));
        }
        if self.max_rounds == 0 {
            return Err(Error::Config("max_rounds must be positive".to_string()));
        }
        Ok(())
    }
}

/// Outbound connection configuration.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Capacity of each priority queue.
    pub queue_size: usize,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for a single request round trip.
    pub request_timeout: Duration,

    /// Minimum delay before reconnecting after a failure.
    pub reconnect_interval: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_size: 80_000,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(100),
        }
    }
}

impl OutboundConfig {
    /// Set the queue size.
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rec_lock_expiration, Duration::from_millis(600));
        assert_eq!(config.redist.max_retry, 3);
        assert_eq!(config.redist.outbound.queue_size, 80_000);
    }

    #[test]
    fn test_micro_shard_defaults() {
        let micro = MicroShardConfig::enabled(0, 0);
        assert_eq!(micro.num_micro_shards, 256);
        assert_eq!(micro.num_micro_shard_groups, 8);

        let disabled = MicroShardConfig {
            enabled: false,
            num_micro_shards: 16,
            num_micro_shard_groups: 4,
        }
        .normalized();
        assert_eq!(disabled.num_micro_shards, 0);
        assert_eq!(disabled.num_micro_shard_groups, 0);
    }

    #[test]
    fn test_invalid_config() {
        let config = NodeConfig::default().with_num_shards(0);
        assert!(config.validate().is_err());

        let config = NodeConfig::default().with_num_shards(4).with_shards([1, 9]);
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.micro_shards = MicroShardConfig {
            enabled: true,
            num_micro_shards: 4,
            num_micro_shard_groups: 8,
        };
        assert!(config.validate().is_err());
    }
}
