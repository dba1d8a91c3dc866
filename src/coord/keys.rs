//! Coordination key names and value formats.

use crate::error::{CoordError, Result};
use crate::types::{NodeId, ShardId};
use std::collections::BTreeMap;

pub const COMP_DELIMITER: &str = "_";
pub const SHARD_DELIMITER: char = ',';
pub const PRIMARY_SECONDARY_DELIMITER: char = '|';
pub const FIELD_SEPARATOR: char = '|';
pub const KEY_VALUE_SEPARATOR: char = '=';
pub const SHARD_MOVE_SEPARATOR: char = '|';

pub const TAG_VERSION: &str = "version";
pub const TAG_NODE_IPPORT: &str = "node_ipport";
pub const TAG_NODE_SHARDS: &str = "node_shards";
pub const TAG_REDIST_ENABLE: &str = "redist_enable";
pub const TAG_REDIST_FROM: &str = "redist_from";
pub const TAG_REDIST_STATE: &str = "redist_state";
pub const TAG_REDIST_TGT_STATE: &str = "redist_tgtstate";
pub const TAG_REDIST_NODE_IPPORT: &str = "redist_node_ipport";
pub const TAG_RATE_LIMIT: &str = "ratelimit";

pub const TGT_STATE_INIT: &str = "init";
pub const TGT_STATE_READY: &str = "ready";

/// Build a key from a prefix and numeric ids. The first id is padded to two
/// digits, the second to three, the rest to five.
pub fn key(prefix: &str, ids: &[u32]) -> String {
    let mut key = prefix.to_string();
    for (i, id) in ids.iter().enumerate() {
        let part = match i {
            0 => format!("{:02}", id),
            1 => format!("{:03}", id),
            _ => format!("{:05}", id),
        };
        key.push_str(COMP_DELIMITER);
        key.push_str(&part);
    }
    key
}

pub fn redist_enable_key(zone: u32) -> String {
    key(TAG_REDIST_ENABLE, &[zone])
}

pub fn redist_from_zone_prefix(zone: u32) -> String {
    key(TAG_REDIST_FROM, &[zone])
}

pub fn redist_from_key(zone: u32, node: NodeId) -> String {
    key(TAG_REDIST_FROM, &[zone, node])
}

/// Key holding the persisted snapshot stats of one outgoing shard.
pub fn redist_state_key(zone: u32, node: NodeId, shard: ShardId) -> String {
    key(TAG_REDIST_STATE, &[zone, node, shard as u32])
}

pub fn redist_tgt_state_key(zone: u32, node: NodeId) -> String {
    key(TAG_REDIST_TGT_STATE, &[zone, node])
}

pub fn node_ipport_zone_prefix(zone: u32) -> String {
    key(TAG_NODE_IPPORT, &[zone])
}

pub fn node_ipport_key(zone: u32, node: NodeId) -> String {
    key(TAG_NODE_IPPORT, &[zone, node])
}

pub fn redist_node_ipport_zone_prefix(zone: u32) -> String {
    key(TAG_REDIST_NODE_IPPORT, &[zone])
}

pub fn redist_node_ipport_key(zone: u32, node: NodeId) -> String {
    key(TAG_REDIST_NODE_IPPORT, &[zone, node])
}

pub fn node_shards_key(zone: u32, node: NodeId) -> String {
    key(TAG_NODE_SHARDS, &[zone, node])
}

/// Node id encoded as the last component of a per-node key.
pub fn node_id_from_key(key: &str) -> Option<NodeId> {
    key.rsplit(COMP_DELIMITER).next()?.parse().ok()
}

// ============================================================================
// Redistribution commands
// ============================================================================

/// Value of `redist_enable_<zone>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedistTag {
    YesTarget,
    YesSource { rate_limit: u32 },
    SourceResume { rate_limit: u32 },
    AbortZone,
    AbortAll,
    No,
}

const VAL_YES_TARGET: &str = "yes_target";
const VAL_YES_SOURCE: &str = "yes_source";
const VAL_YES_SOURCE_RL: &str = "yes_source_rl";
const VAL_SOURCE_RESUME: &str = "source_resume";
const VAL_SOURCE_RESUME_RL: &str = "source_resume_rl";
const VAL_ABORT_ZONE: &str = "abort_zone";
const VAL_ABORT_ALL: &str = "abort_all";
const VAL_NO: &str = "no";

impl RedistTag {
    /// Parse a command value. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            VAL_YES_TARGET => return Some(RedistTag::YesTarget),
            VAL_YES_SOURCE => return Some(RedistTag::YesSource { rate_limit: 0 }),
            VAL_SOURCE_RESUME => return Some(RedistTag::SourceResume { rate_limit: 0 }),
            VAL_ABORT_ZONE => return Some(RedistTag::AbortZone),
            VAL_ABORT_ALL => return Some(RedistTag::AbortAll),
            VAL_NO => return Some(RedistTag::No),
            _ => {}
        }
        if value.starts_with(VAL_YES_SOURCE_RL) {
            return Some(RedistTag::YesSource {
                rate_limit: parse_rate_limit(value),
            });
        }
        if value.starts_with(VAL_SOURCE_RESUME_RL) {
            return Some(RedistTag::SourceResume {
                rate_limit: parse_rate_limit(value),
            });
        }
        None
    }

    /// Render as a command value.
    pub fn to_value(&self) -> String {
        match self {
            RedistTag::YesTarget => VAL_YES_TARGET.to_string(),
            RedistTag::YesSource { rate_limit: 0 } => VAL_YES_SOURCE.to_string(),
            RedistTag::YesSource { rate_limit } => {
                format!("{}|{}={}", VAL_YES_SOURCE_RL, TAG_RATE_LIMIT, rate_limit)
            }
            RedistTag::SourceResume { rate_limit: 0 } => VAL_SOURCE_RESUME.to_string(),
            RedistTag::SourceResume { rate_limit } => {
                format!("{}|{}={}", VAL_SOURCE_RESUME_RL, TAG_RATE_LIMIT, rate_limit)
            }
            RedistTag::AbortZone => VAL_ABORT_ZONE.to_string(),
            RedistTag::AbortAll => VAL_ABORT_ALL.to_string(),
            RedistTag::No => VAL_NO.to_string(),
        }
    }
}

/// Extract `ratelimit=<n>` from the second field of a command value.
pub fn parse_rate_limit(value: &str) -> u32 {
    let mut fields = value.split(FIELD_SEPARATOR);
    let _ = fields.next();
    let Some(field) = fields.next() else {
        return 0;
    };
    let mut kv = field.split(KEY_VALUE_SEPARATOR);
    match (kv.next(), kv.next()) {
        (Some(TAG_RATE_LIMIT), Some(v)) => v.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Parse a change map `"<shard>_<node>|<shard>_<node>"`.
pub fn parse_change_map(key: &str, value: &str) -> Result<BTreeMap<ShardId, NodeId>> {
    let mut map = BTreeMap::new();
    for entry in value.split(SHARD_MOVE_SEPARATOR).filter(|s| !s.is_empty()) {
        let malformed = || CoordError::Malformed {
            key: key.to_string(),
            value: value.to_string(),
        };
        let mut parts = entry.split(COMP_DELIMITER);
        let shard = parts
            .next()
            .and_then(|s| s.trim().parse::<ShardId>().ok())
            .ok_or_else(malformed)?;
        let node = parts
            .next()
            .and_then(|s| s.trim().parse::<NodeId>().ok())
            .ok_or_else(malformed)?;
        map.insert(shard, node);
    }
    Ok(map)
}

/// Parse the primary shard list of a `node_shards` value: `"1,2,3|7,8"`.
pub fn parse_node_shards(value: &str) -> Vec<ShardId> {
    value
        .split(PRIMARY_SECONDARY_DELIMITER)
        .next()
        .unwrap_or("")
        .split(SHARD_DELIMITER)
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}
