//! Network communication layer.

pub mod rpc;
pub mod server;
pub mod tcp_target;

pub use rpc::{read_message, write_message, MAX_FRAME_LEN};
pub use server::NetworkServer;
pub use tcp_target::{TcpConnector, TcpReplicationTarget};
