//! Reaction to coordination store changes.
//!
//! The watcher follows two keys: the zone's `redist_enable_<zone>` command
//! and the cluster-wide shard map `version`. Commands toggle this node's role
//! in a redistribution; a newer shard map moves storage ownership once no
//! redistribution is running.

use crate::config::NodeConfig;
use crate::coord::{keys, ClusterReader, RedistTag, WatchEvent, WatchStream};
use crate::error::Result;
use crate::redist::RedistContext;
use crate::storage::Database;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Applies redistribution commands and shard map updates to this node.
pub struct Watcher {
    reader: ClusterReader,
    db: Arc<Database>,
    redist: Arc<RedistContext>,
    version: AtomicU32,
    update_delay: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(
        config: &NodeConfig,
        reader: ClusterReader,
        db: Arc<Database>,
        redist: Arc<RedistContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reader,
            db,
            redist,
            version: AtomicU32::new(0),
            update_delay: config.shard_map_update_delay,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Shard map version currently applied.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Subscribe to the watched keys, pick up any command already in place
    /// and follow changes in the background.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let enable_key = keys::redist_enable_key(self.reader.zone_id());
        let store = self.reader.store();
        let versions = store.watch(keys::TAG_VERSION);
        let commands = store.watch(&enable_key);

        self.version
            .store(self.reader.read_version().await?, Ordering::SeqCst);

        if let Some(value) = self.reader.read_redist_enable().await? {
            match RedistTag::parse(&value) {
                Some(tag) => self.process_redist_tag(tag, true).await,
                None => warn!(value = %value, "Unknown redistribution command at startup"),
            }
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(versions, commands).await });
        *self.task.lock() = Some(handle);
        info!(
            node_id = self.reader.node_id(),
            version = self.version(),
            "Watcher started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(&self, mut versions: WatchStream, mut commands: WatchStream) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                ev = versions.next() => ev,
                ev = commands.next() => ev,
            };
            match event {
                Some(ev) => self.handle_event(ev).await,
                None => {
                    warn!("Coordination store closed, watcher exiting");
                    break;
                }
            }
        }
        debug!("Watcher loop exited");
    }

    /// Dispatch one coordination event.
    pub async fn handle_event(&self, event: WatchEvent) {
        let WatchEvent::Put { key, value } = event else {
            return;
        };
        if key == keys::TAG_VERSION {
            self.on_version_change(&value).await;
        } else if key == keys::redist_enable_key(self.reader.zone_id()) {
            match RedistTag::parse(&value) {
                Some(tag) => self.process_redist_tag(tag, false).await,
                None => warn!(value = %value, "Unknown redistribution command"),
            }
        }
    }

    /// Act on a redistribution command. `restart` is set when the command was
    /// already in place when this node started.
    pub async fn process_redist_tag(&self, tag: RedistTag, restart: bool) {
        info!(?tag, restart, "Redistribution command");
        match tag {
            RedistTag::YesTarget => self.set_target(true).await,
            RedistTag::AbortZone | RedistTag::AbortAll => {
                self.redist.stop().await;
                self.set_target(false).await;
            }
            RedistTag::SourceResume { rate_limit } => {
                if restart {
                    self.set_target(true).await;
                    self.redist.start(rate_limit as u64).await;
                } else {
                    self.redist.resume(rate_limit as u64);
                }
            }
            RedistTag::YesSource { rate_limit } => {
                if restart {
                    self.set_target(true).await;
                }
                self.redist.start(rate_limit as u64).await;
            }
            RedistTag::No => {}
        }
    }

    /// Accept or stop accepting the shards moving to this node.
    async fn set_target(&self, enable: bool) {
        let mut shards = BTreeSet::new();
        if enable {
            shards = match self.reader.read_redist_target_shards().await {
                Ok(shards) => shards,
                Err(e) => {
                    error!(error = %e, "Cannot read redistribution target shards");
                    return;
                }
            };
            if shards.is_empty() {
                return;
            }
        }
        self.db.update_redist_shards(shards);

        if enable {
            if let Err(e) = self.reader.put_target_ready().await {
                error!(error = %e, "Failed to report target ready");
            }
        }
    }

    /// Apply a newer shard map. Refused while a redistribution is running.
    pub async fn on_version_change(&self, value: &str) {
        let version = match value.trim().parse::<u32>() {
            Ok(v) => v,
            Err(_) => {
                warn!(value = %value, "Malformed shard map version");
                return;
            }
        };
        let current = self.version();
        if version <= current {
            debug!(version, current, "Ignoring stale shard map version");
            return;
        }
        if self.redist.is_in_progress() {
            error!(version, "Shard map changed while redistribution is in progress");
            return;
        }

        tokio::time::sleep(self.update_delay).await;

        let shards = match self.reader.read_node_shards().await {
            Ok(shards) => shards,
            Err(e) => {
                error!(version, error = %e, "Cannot read node shards");
                return;
            }
        };
        info!(version, ?shards, "Applying shard map");
        if let Err(e) = self.db.update_shards(shards).await {
            error!(version, error = %e, "Failed to update shards");
            return;
        }

        self.redist.stop().await;
        self.set_target(false).await;
        self.version.store(version, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("node_id", &self.reader.node_id())
            .field("version", &self.version())
            .finish()
    }
}
