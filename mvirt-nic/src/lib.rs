pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod flags;
pub mod health;
pub mod hw;
pub mod moderation;
pub mod packet;
pub mod poll;
pub mod queue;
pub mod ring;
pub mod rx;
pub mod stats;
pub mod test_util;
pub mod tx;

pub use config::EngineConfig;
pub use device::Device;
pub use error::{EngineError, Result, TxError};
pub use filter::{FilterProgram, Verdict};
pub use flags::{DeviceState, ResetReason};
pub use packet::{Frame, InboundPacket, OutboundPacket};
pub use poll::PollOutcome;
pub use stats::CounterSnapshot;
pub use tx::TxOutcome;
