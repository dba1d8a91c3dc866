//! Storage node assembly.

use crate::config::NodeConfig;
use crate::coord::{ClusterReader, CoordinationStore};
use crate::error::Result;
use crate::network::{NetworkServer, TcpConnector};
use crate::processor::RequestProcessor;
use crate::redist::{RedistContext, TargetConnector, Watcher};
use crate::storage::{Database, EngineFactory, MemoryEngineFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// A running storage node.
pub struct StorageNode {
    config: NodeConfig,
    db: Arc<Database>,
    processor: Arc<RequestProcessor>,
    redist: Arc<RedistContext>,
    watcher: Arc<Watcher>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl StorageNode {
    /// Start a node with engines chosen from the configuration and TCP
    /// connections to redistribution targets.
    pub async fn start(config: NodeConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        let factory = Self::engine_factory(&config);
        Self::start_with(config, store, factory, Arc::new(TcpConnector)).await
    }

    /// This will:
    /// 1. Open storage for the configured shards
    /// 2. Create the redistribution context and request processor
    /// 3. Start the network server
    /// 4. Start watching the coordination store
    pub async fn start_with(
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        factory: Arc<dyn EngineFactory>,
        connector: Arc<dyn TargetConnector>,
    ) -> Result<Self> {
        config.validate()?;
        info!(zone_id = config.zone_id, node_id = config.node_id, "Starting storage node");

        let db = Arc::new(Database::open(&config, factory)?);
        let reader = ClusterReader::new(store, config.zone_id, config.node_id);
        let redist = Arc::new(RedistContext::new(
            config.redist.clone(),
            reader.clone(),
            db.clone(),
            connector,
        ));
        let processor = RequestProcessor::new(&config, db.clone(), redist.clone());

        let (server, shutdown_tx) = NetworkServer::bind(config.listen_addr, processor.clone()).await?;
        let local_addr = server.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Network server error");
            }
        });

        let watcher = Watcher::new(&config, reader, db.clone(), redist.clone());
        watcher.start().await?;

        info!(node_id = config.node_id, addr = %local_addr, "Storage node started");
        Ok(Self {
            config,
            db,
            processor,
            redist,
            watcher,
            local_addr,
            shutdown_tx,
        })
    }

    #[cfg(feature = "rocksdb-storage")]
    fn engine_factory(config: &NodeConfig) -> Arc<dyn EngineFactory> {
        use crate::storage::{RocksEngineConfig, RocksEngineFactory};
        match &config.data_dir {
            Some(dir) => Arc::new(RocksEngineFactory::new(dir, RocksEngineConfig::default())),
            None => Arc::new(MemoryEngineFactory::new()),
        }
    }

    #[cfg(not(feature = "rocksdb-storage"))]
    fn engine_factory(_config: &NodeConfig) -> Arc<dyn EngineFactory> {
        Arc::new(MemoryEngineFactory::new())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn processor(&self) -> &Arc<RequestProcessor> {
        &self.processor
    }

    pub fn redist(&self) -> &Arc<RedistContext> {
        &self.redist
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    /// Address the request listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self) {
        info!(node_id = self.config.node_id, "Shutting down storage node");
        self.watcher.stop().await;
        self.redist.stop().await;
        let _ = self.shutdown_tx.send(()).await;
        self.db.shutdown();
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("zone_id", &self.config.zone_id)
            .field("node_id", &self.config.node_id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
