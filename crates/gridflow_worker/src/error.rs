//! Worker error taxonomy.

use gridflow_protocol::{ModbusExceptionKind, PointId, ProtocolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker is not in a connected state; writes fail fast.
    #[error("not connected")]
    NotConnected,

    /// The transport dropped; the base layer reconnects with backoff.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("worker factory: {0}")]
    Factory(String),

    /// A device rejected a write; carries enough to tell the operator what
    /// was addressed.
    #[error("write rejected by slave {slave} at address {address}: {kind}")]
    WriteRejected { slave: u8, address: u16, kind: ModbusExceptionKind },

    #[error("point {0} is not writable")]
    NotWritable(PointId),

    #[error("point {0} not found on this worker")]
    UnknownPoint(PointId),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("worker is stopped")]
    Stopped,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] gridflow_db::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Failures that should tear down the transport and re-enter the
    /// reconnect path.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            WorkerError::ConnectionLost(_) | WorkerError::Io(_) | WorkerError::NotConnected
        )
    }
}
