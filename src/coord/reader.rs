//! Typed reads of cluster and redistribution state.

use crate::coord::keys;
use crate::coord::CoordinationStore;
use crate::error::{CoordError, Result};
use crate::types::{NodeId, ShardId, ZoneId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Reads cluster layout for one node.
#[derive(Debug, Clone)]
pub struct ClusterReader {
    store: Arc<dyn CoordinationStore>,
    zone_id: ZoneId,
    node_id: NodeId,
}

impl ClusterReader {
    pub fn new(store: Arc<dyn CoordinationStore>, zone_id: ZoneId, node_id: NodeId) -> Self {
        Self {
            store,
            zone_id,
            node_id,
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Current shard map version, 0 when unset.
    pub async fn read_version(&self) -> Result<u32> {
        let Some(value) = self.store.get_value(keys::TAG_VERSION).await? else {
            return Ok(0);
        };
        let parsed = value.trim().parse::<u32>();
        parsed.map_err(|_| {
            CoordError::Malformed {
                key: keys::TAG_VERSION.to_string(),
                value,
            }
            .into()
        })
    }

    /// Shards owned by this node in the current shard map.
    pub async fn read_node_shards(&self) -> Result<BTreeSet<ShardId>> {
        let key = keys::node_shards_key(self.zone_id, self.node_id);
        let value = self.store.get_value(&key).await?.unwrap_or_default();
        Ok(keys::parse_node_shards(&value).into_iter().collect())
    }

    /// Addresses of every node in the zone, indexed by node id. Nodes joining
    /// through redistribution are included.
    pub async fn read_conn_info(&self) -> Result<Vec<String>> {
        let mut addrs: BTreeMap<NodeId, String> = BTreeMap::new();
        for prefix in [
            keys::node_ipport_zone_prefix(self.zone_id),
            keys::redist_node_ipport_zone_prefix(self.zone_id),
        ] {
            for (key, value) in self.store.get_with_prefix(&format!("{}_", prefix)).await? {
                if let Some(node) = keys::node_id_from_key(&key) {
                    addrs.entry(node).or_insert(value);
                }
            }
        }
        let len = addrs.keys().next_back().map(|n| *n as usize + 1).unwrap_or(0);
        let mut conn_info = vec![String::new(); len];
        for (node, addr) in addrs {
            conn_info[node as usize] = addr;
        }
        Ok(conn_info)
    }

    /// Outgoing shards of this node and their destination nodes.
    pub async fn read_redist_change_map(&self) -> Result<Option<BTreeMap<ShardId, NodeId>>> {
        let key = keys::redist_from_key(self.zone_id, self.node_id);
        match self.store.get_value(&key).await? {
            Some(value) => {
                let map = keys::parse_change_map(&key, &value)?;
                if map.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(map))
                }
            }
            None => Ok(None),
        }
    }

    /// Shards any source node in the zone is moving to this node.
    pub async fn read_redist_target_shards(&self) -> Result<BTreeSet<ShardId>> {
        let prefix = keys::redist_from_zone_prefix(self.zone_id);
        let mut shards = BTreeSet::new();
        for (key, value) in self.store.get_with_prefix(&format!("{}_", prefix)).await? {
            for (shard, node) in keys::parse_change_map(&key, &value)? {
                if node == self.node_id {
                    shards.insert(shard);
                }
            }
        }
        debug!(node_id = self.node_id, ?shards, "Read redistribution target shards");
        Ok(shards)
    }

    pub async fn read_redist_enable(&self) -> Result<Option<String>> {
        self.store
            .get_value(&keys::redist_enable_key(self.zone_id))
            .await
    }

    pub async fn put_target_ready(&self) -> Result<()> {
        let key = keys::redist_tgt_state_key(self.zone_id, self.node_id);
        self.store
            .put_value(&key, keys::TGT_STATE_READY, 1, std::time::Duration::from_secs(1))
            .await
    }
}
