//! TCP connection to a redistribution target node.

use crate::config::OutboundConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_message, write_message};
use crate::redist::{ReplicationTarget, TargetConnector};
use crate::types::OperationalMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One lazily opened connection, used for one request at a time.
pub struct TcpReplicationTarget {
    addr: String,
    config: OutboundConfig,
    conn: Mutex<Option<TcpStream>>,
    last_failure: parking_lot::Mutex<Option<Instant>>,
}

impl TcpReplicationTarget {
    pub fn new(addr: impl Into<String>, config: OutboundConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            conn: Mutex::new(None),
            last_failure: parking_lot::Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: "connection timeout".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        debug!(addr = %self.addr, "Connected to redistribution target");
        Ok(stream)
    }

    async fn round_trip(stream: &mut TcpStream, msg: &OperationalMessage) -> Result<OperationalMessage> {
        write_message(stream, msg).await?;
        loop {
            let Some(resp) = read_message(stream).await? else {
                return Err(NetworkError::ConnectionClosed.into());
            };
            if resp.request_id == msg.request_id {
                return Ok(resp);
            }
            // Reply to an earlier request that timed out.
            debug!(request_id = %resp.request_id, "Discarding stale reply");
        }
    }
}

#[async_trait]
impl ReplicationTarget for TcpReplicationTarget {
    async fn send(&self, msg: &OperationalMessage) -> Result<OperationalMessage> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            match self.connect().await {
                Ok(stream) => *conn = Some(stream),
                Err(e) => {
                    *self.last_failure.lock() = Some(Instant::now());
                    return Err(e);
                }
            }
        }

        let Some(stream) = conn.as_mut() else {
            return Err(NetworkError::ConnectionClosed.into());
        };
        let result =
            match tokio::time::timeout(self.config.request_timeout, Self::round_trip(stream, msg)).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout),
            };

        match result {
            Ok(resp) => {
                *self.last_failure.lock() = None;
                Ok(resp)
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "Request to redistribution target failed");
                *conn = None;
                *self.last_failure.lock() = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// Not ready for a short while after a failure.
    fn is_ready(&self) -> bool {
        match *self.last_failure.lock() {
            Some(at) => at.elapsed() >= self.config.reconnect_interval,
            None => true,
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

/// Opens [`TcpReplicationTarget`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TargetConnector for TcpConnector {
    fn connect(&self, addr: &str, config: &OutboundConfig) -> Arc<dyn ReplicationTarget> {
        Arc::new(TcpReplicationTarget::new(addr, config.clone()))
    }
}
