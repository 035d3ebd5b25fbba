//! Adaptive interrupt moderation
//!
//! Packets and bytes are accumulated across the polls that belong to one
//! interrupt. When the poll completes, the totals become one sample: both
//! are smoothed with an exponential moving average, each average selects
//! a profile level through its threshold table, and the higher of the two
//! is the target. The current level moves at most one step toward the
//! target per sample, so the interval never jumps across the profile.

use crate::config::ModerationConfig;

#[derive(Debug, Clone)]
pub struct ModerationEstimator {
    profile: Vec<u32>,
    packet_thresholds: Vec<u32>,
    byte_thresholds: Vec<u64>,
    shift: u32,
    level: usize,
    avg_packets: i64,
    avg_bytes: i64,
    packets: u64,
    bytes: u64,
}

impl ModerationEstimator {
    pub fn new(config: &ModerationConfig) -> Self {
        Self {
            profile: config.profile_usecs.clone(),
            packet_thresholds: config.packet_thresholds.clone(),
            byte_thresholds: config.byte_thresholds.clone(),
            shift: config.smoothing_shift,
            level: 0,
            avg_packets: 0,
            avg_bytes: 0,
            packets: 0,
            bytes: 0,
        }
    }

    /// Account work done by one poll.
    #[inline]
    pub fn record(&mut self, packets: u32, bytes: u64) {
        self.packets += packets as u64;
        self.bytes += bytes;
    }

    /// Close the current interrupt and return the interval to program.
    pub fn sample(&mut self) -> u32 {
        let packets = std::mem::take(&mut self.packets) as i64;
        let bytes = std::mem::take(&mut self.bytes) as i64;
        self.avg_packets += (packets - self.avg_packets) >> self.shift;
        self.avg_bytes += (bytes - self.avg_bytes) >> self.shift;

        let target = level_for(&self.packet_thresholds, self.avg_packets as u64)
            .max(level_for(&self.byte_thresholds, self.avg_bytes as u64));

        if target > self.level {
            self.level += 1;
        } else if target < self.level {
            self.level -= 1;
        }
        self.interval_usecs()
    }

    #[inline]
    pub fn interval_usecs(&self) -> u32 {
        self.profile.get(self.level).copied().unwrap_or(0)
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Back to the start-up state.
    pub fn reset(&mut self) {
        self.level = 0;
        self.avg_packets = 0;
        self.avg_bytes = 0;
        self.packets = 0;
        self.bytes = 0;
    }
}

/// Highest level whose threshold `value` reaches.
fn level_for<T: Copy + Into<u64>>(thresholds: &[T], value: u64) -> usize {
    thresholds
        .iter()
        .rposition(|t| value >= (*t).into())
        .unwrap_or(0)
}
