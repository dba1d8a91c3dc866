//! Error types for the storage node.

use std::io;
use thiserror::Error;

/// Result type alias for storage node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage node.
///
/// Request-path code never hands these to clients; they are folded into an
/// [`OpStatus`](crate::types::OpStatus) before a reply is built.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage engine errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Coordination store errors.
    #[error("coordination error: {0}")]
    Coord(#[from] CoordError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Stored value could not be decoded.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Outbound queue has no room for another request.
    #[error("outbound queue full")]
    QueueFull,

    /// Outbound connection is not ready to accept requests.
    #[error("outbound connection not ready")]
    NotReady,

    /// No prepare holder is waiting for a phase-two request.
    #[error("missing two-phase context")]
    MissingTwoPhaseContext,

    /// The prepare holder's lock already expired.
    #[error("two-phase lock expired")]
    LockExpired,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No engine is open for the shard.
    #[error("shard not found: {0}")]
    ShardNotFound(u16),

    /// The storage handle was shut down.
    #[error("storage closed")]
    Closed,

    /// Underlying engine error.
    #[error("engine error: {0}")]
    Engine(String),

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Coordination store errors.
#[derive(Error, Debug)]
pub enum CoordError {
    /// Put did not succeed within the allowed attempts.
    #[error("put {key} failed after {tries} tries")]
    PutFailed { key: String, tries: u32 },

    /// Transaction was rejected.
    #[error("transaction failed: {0}")]
    TxnFailed(String),

    /// Value could not be parsed.
    #[error("malformed value for {key}: {value}")]
    Malformed { key: String, value: String },

    /// Store is unavailable.
    #[error("coordination store unavailable")]
    Unavailable,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(feature = "rocksdb-storage")]
impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(StorageError::Engine(e.into_string()))
    }
}
