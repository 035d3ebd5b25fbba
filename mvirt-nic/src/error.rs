//! Error types for the packet engine
//!
//! Each layer gets its own enum so callers can tell a device-side failure
//! apart from a local resource failure. Backpressure is never an error:
//! a full ring hands the packet back through `TxOutcome::Busy`.

use std::io;

use thiserror::Error;

use crate::flags::DeviceState;
use crate::ring::RingError;

/// Failures reported by the management channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error("admin channel is not running")]
    NotRunning,

    #[error("device is out of memory")]
    NoMemory,

    #[error("admin command timed out")]
    Timeout,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device rejected command: {0}")]
    Rejected(String),
}

/// Failures reported by a hardware submission or completion queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    #[error("submission queue has no space")]
    NoSpace,

    #[error("malformed descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("queue has been destroyed")]
    QueueGone,
}

/// Failures while mapping memory for device access.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("mapping of {len} bytes failed")]
    MappingFailed { len: usize },
}

/// Failures while obtaining a receive buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("buffer pool exhausted")]
    Exhausted,

    #[error("DMA mapping error: {0}")]
    Dma(#[from] DmaError),
}

/// Failures on the transmit path that consume the packet.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("packet has no data")]
    Empty,

    #[error("packet needs {segments} segments, device accepts {max}")]
    TooManySegments { segments: usize, max: usize },

    #[error("linearize failed")]
    LinearizeFailed,

    #[error("DMA mapping error: {0}")]
    Dma(#[from] DmaError),

    #[error("hardware error: {0}")]
    Hardware(#[from] HwError),

    #[error("device has failed")]
    DeviceFailed,

    #[error("queue {0} does not exist")]
    NoQueue(u16),
}

/// A completion that contradicts the engine's own bookkeeping.
///
/// Always escalates to a device reset.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("queue {qid}: completion for unknown tx request id {req_id}")]
    InvalidTxReqId { qid: u16, req_id: u16 },

    #[error("queue {qid}: completion for unknown rx request id {req_id}")]
    InvalidRxReqId { qid: u16, req_id: u16 },

    #[error("queue {qid}: packet spans more than {max} descriptors")]
    TooManyRxDescs { qid: u16, max: usize },

    #[error("queue {qid}: rx length {len} exceeds buffer size {size}")]
    ImpossibleRxLength { qid: u16, len: u32, size: usize },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("admin error: {0}")]
    Admin(#[from] AdminError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    #[error("device capability mismatch: {0}")]
    Capability(String),

    #[error("operation not allowed in state {0}")]
    InvalidState(DeviceState),

    #[error("device has failed")]
    Failed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
