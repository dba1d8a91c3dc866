//! TCP server for proxy and peer requests.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_message, write_message};
use crate::processor::RequestProcessor;
use crate::types::OperationalMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Replies waiting to be written back on one connection.
const REPLY_QUEUE_SIZE: usize = 1024;

/// Accepts connections and hands every request to the processor.
pub struct NetworkServer {
    listener: TcpListener,
    processor: Arc<RequestProcessor>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind the listener. The returned sender stops the server.
    pub async fn bind(
        addr: SocketAddr,
        processor: Arc<RequestProcessor>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(addr).await.map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let server = Self {
            listener,
            processor,
            shutdown_rx,
        };
        Ok((server, shutdown_tx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let processor = self.processor.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, processor).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Requests on one connection run concurrently, so replies may be written
    /// out of order. Peers match them by request id.
    async fn handle_connection(stream: TcpStream, processor: Arc<RequestProcessor>) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<OperationalMessage>(REPLY_QUEUE_SIZE);

        let writer_task = tokio::spawn(async move {
            while let Some(resp) = reply_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &resp).await {
                    debug!(error = %e, "Failed to write reply");
                    break;
                }
            }
        });

        let result = loop {
            let msg = match read_message(&mut reader).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let processor = processor.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let request_id = msg.request_id;
                match processor.call(msg).await {
                    Ok(resp) => {
                        let _ = reply_tx.send(resp).await;
                    }
                    Err(e) => debug!(request_id = %request_id, error = %e, "Request dropped"),
                }
            });
        };

        drop(reply_tx);
        let _ = writer_task.await;
        result
    }
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("addr", &self.listener.local_addr().ok())
            .finish()
    }
}
