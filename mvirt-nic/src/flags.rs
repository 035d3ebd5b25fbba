//! Device-wide state flags, lifecycle state and reset reasons
//!
//! Every engine on every queue reads these flags without taking a lock.
//! A reset trigger is a single atomic read-modify-write so concurrent
//! detections collapse into one reset with the first recorded reason.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Queues are created and the device is administratively up.
pub const ADMIN_UP: u32 = 1 << 0;
/// Interrupts may be unmasked by the poll path.
pub const INTERRUPTS_ENABLED: u32 = 1 << 1;
/// Some component asked for a reset that has not started yet.
pub const RESET_REQUESTED: u32 = 1 << 2;
/// A reset is tearing down or rebuilding the device.
pub const RESET_IN_PROGRESS: u32 = 1 << 3;
/// Device is attached and the admin channel was initialized.
pub const DEVICE_RUNNING: u32 = 1 << 4;
/// Reinitialization failed. Terminal until the device is attached again.
pub const FAILED: u32 = 1 << 5;

/// Pending reset reason lives in the top byte of the flag word.
const REASON_SHIFT: u32 = 24;
const REASON_MASK: u32 = 0xff << REASON_SHIFT;

/// Why a reset was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ResetReason {
    Normal = 1,
    KeepAliveTimeout = 2,
    AdminTimeout = 3,
    MissingTxCompletion = 4,
    MissingInterrupt = 5,
    TxStall = 6,
    InvalidTxReqId = 7,
    InvalidRxReqId = 8,
    TooManyRxDescs = 9,
    DriverInvalidState = 10,
    UserRequest = 11,
}

impl ResetReason {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Normal,
            2 => Self::KeepAliveTimeout,
            3 => Self::AdminTimeout,
            4 => Self::MissingTxCompletion,
            5 => Self::MissingInterrupt,
            6 => Self::TxStall,
            7 => Self::InvalidTxReqId,
            8 => Self::InvalidRxReqId,
            9 => Self::TooManyRxDescs,
            10 => Self::DriverInvalidState,
            11 => Self::UserRequest,
            _ => return None,
        })
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::KeepAliveTimeout => "keep_alive_timeout",
            Self::AdminTimeout => "admin_timeout",
            Self::MissingTxCompletion => "missing_tx_completion",
            Self::MissingInterrupt => "missing_interrupt",
            Self::TxStall => "tx_stall",
            Self::InvalidTxReqId => "invalid_tx_req_id",
            Self::InvalidRxReqId => "invalid_rx_req_id",
            Self::TooManyRxDescs => "too_many_rx_descs",
            Self::DriverInvalidState => "driver_invalid_state",
            Self::UserRequest => "user_request",
        };
        f.write_str(name)
    }
}

/// Lifecycle state as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Down = 0,
    Running = 1,
    ResetRequested = 2,
    TearingDown = 3,
    Reinitializing = 4,
    Failed = 5,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Down => "down",
            Self::Running => "running",
            Self::ResetRequested => "reset_requested",
            Self::TearingDown => "tearing_down",
            Self::Reinitializing => "reinitializing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Atomic flag word. The top byte holds the reason of the pending reset.
#[derive(Debug, Default)]
pub struct DeviceFlags {
    bits: AtomicU32,
}

impl DeviceFlags {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn test(&self, flag: u32) -> bool {
        self.bits.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub fn set(&self, flag: u32) {
        self.bits.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, flag: u32) {
        self.bits.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Data path may move packets: up, no reset pending, not failed.
    #[inline]
    pub fn accepting_traffic(&self) -> bool {
        let bits = self.bits.load(Ordering::Acquire);
        bits & ADMIN_UP != 0 && bits & (RESET_REQUESTED | RESET_IN_PROGRESS | FAILED) == 0
    }

    /// Record a reset request.
    ///
    /// Returns true only for the caller that moved the device into the
    /// requested state. Requests while a reset is already running or after
    /// the device failed are ignored. The flag and the reason are published
    /// by the same exchange.
    pub fn request_reset(&self, reason: ResetReason) -> bool {
        let mut bits = self.bits.load(Ordering::Acquire);
        loop {
            if bits & (RESET_REQUESTED | RESET_IN_PROGRESS | FAILED) != 0
                || bits & DEVICE_RUNNING == 0
            {
                return false;
            }
            let next = (bits & !REASON_MASK)
                | RESET_REQUESTED
                | (u32::from(reason as u8) << REASON_SHIFT);
            match self
                .bits
                .compare_exchange_weak(bits, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => bits = current,
            }
        }
    }

    /// Reason recorded by the pending reset request.
    pub fn reset_reason(&self) -> Option<ResetReason> {
        ResetReason::from_u8((self.bits.load(Ordering::Acquire) >> REASON_SHIFT) as u8)
    }

    /// Forget the recorded reason once a reset has been carried out.
    pub fn take_reset_reason(&self) -> Option<ResetReason> {
        let prev = self.bits.fetch_and(!REASON_MASK, Ordering::AcqRel);
        ResetReason::from_u8((prev >> REASON_SHIFT) as u8)
    }
}
