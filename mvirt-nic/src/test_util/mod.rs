//! Simulated adapter and host for tests and the demo binary
//!
//! The simulated device moves real bytes through the engine's buffers,
//! so tests can check data integrity as well as bookkeeping.

pub mod host;
pub mod packets;
pub mod sim;

pub use host::{FlakyMapper, RecordingHost};
pub use packets::{UdpDatagram, UdpFlow, create_udp_frame, parse_udp_frame, sequenced_frame};
pub use sim::{SimNic, SimRx, SimTx};
