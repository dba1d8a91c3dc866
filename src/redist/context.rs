//! Redistribution state shared by the request path and the watcher.

use crate::config::RedistConfig;
use crate::coord::ClusterReader;
use crate::redist::manager::{Manager, SnapshotSource};
use crate::redist::outbound::TargetConnector;
use crate::types::{NodeId, OperationalMessage, ShardId, ZoneId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Whether this node is a redistribution source, and its active manager.
pub struct RedistContext {
    zone_id: ZoneId,
    node_id: NodeId,
    config: Arc<RedistConfig>,
    reader: ClusterReader,
    source: Arc<dyn SnapshotSource>,
    connector: Arc<dyn TargetConnector>,
    enabled: AtomicBool,
    manager: RwLock<Option<Arc<Manager>>>,
}

impl RedistContext {
    pub fn new(
        config: RedistConfig,
        reader: ClusterReader,
        source: Arc<dyn SnapshotSource>,
        connector: Arc<dyn TargetConnector>,
    ) -> Self {
        Self {
            zone_id: reader.zone_id(),
            node_id: reader.node_id(),
            config: Arc::new(config),
            reader,
            source,
            connector,
            enabled: AtomicBool::new(false),
            manager: RwLock::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn manager(&self) -> Option<Arc<Manager>> {
        self.manager.read().clone()
    }

    /// Mirror a live write when the shard is being moved out.
    pub fn forward(&self, shard_id: ShardId, msg: OperationalMessage) {
        if !self.is_enabled() {
            return;
        }
        if let Some(manager) = self.manager() {
            manager.forward(shard_id, msg);
        }
    }

    /// Begin moving this node's outgoing shards. Ignored while already
    /// enabled or when no shard is assigned to move.
    pub async fn start(&self, rate_limit_kbps: u64) {
        if self.is_enabled() {
            warn!(node_id = self.node_id, "Redistribution already in progress, ignoring start");
            return;
        }

        let conn_info = match self.reader.read_conn_info().await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "Cannot read node addresses");
                return;
            }
        };
        let change_map = match self.reader.read_redist_change_map().await {
            Ok(Some(map)) => map,
            Ok(None) => {
                info!(node_id = self.node_id, "No shards to move out");
                return;
            }
            Err(e) => {
                error!(error = %e, "Cannot read redistribution change map");
                return;
            }
        };
        info!(node_id = self.node_id, ?change_map, rate_limit_kbps, "Starting redistribution");

        let manager = match Manager::start(
            self.zone_id,
            self.node_id,
            &conn_info,
            &change_map,
            self.config.clone(),
            self.reader.store().clone(),
            self.source.clone(),
            self.connector.as_ref(),
            rate_limit_kbps,
        ) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "Failed to create redistribution manager");
                return;
            }
        };
        *self.manager.write() = Some(manager);
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Rerun a finished or aborted manager with a new rate limit.
    pub fn resume(&self, rate_limit_kbps: u64) {
        if !self.is_enabled() {
            info!(node_id = self.node_id, "Redistribution not enabled, ignoring resume");
            return;
        }
        if let Some(manager) = self.manager() {
            manager.resume(rate_limit_kbps);
        }
    }

    pub async fn stop(&self) {
        if !self.is_enabled() {
            return;
        }
        self.enabled.store(false, Ordering::SeqCst);
        let manager = self.manager.write().take();
        if let Some(manager) = manager {
            manager.stop().await;
        }
    }

    /// A manager exists and its run has not exited.
    pub fn is_in_progress(&self) -> bool {
        self.is_enabled() && self.manager().map(|m| !m.is_done()).unwrap_or(false)
    }
}

impl std::fmt::Debug for RedistContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedistContext")
            .field("zone_id", &self.zone_id)
            .field("node_id", &self.node_id)
            .field("enabled", &self.is_enabled())
            .field("manager", &self.manager())
            .finish()
    }
}
