//! Protocol workers for gridflow.
//!
//! One worker per device. The base layer owns the shared lifecycle
//! (connect, backoff, keep-alive, commands); the protocol modules implement
//! Modbus TCP/RTU polling, BACnet discovery + COV, and MQTT subscriptions.
//! The manager keys workers by device id and routes the write path.

pub mod bacnet;
pub mod base;
pub mod error;
pub mod manager;
pub mod modbus_rtu;
pub mod modbus_tcp;
pub mod mqtt;
pub mod polling;

pub use base::{BackoffPolicy, ProtocolWorker, RunnerConfig, WorkerShared, WorkerState};
pub use error::{Result, WorkerError};
pub use manager::{WorkerHandle, WorkerManager};
