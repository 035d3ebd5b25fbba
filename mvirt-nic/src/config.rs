//! Engine configuration
//!
//! Loaded from a JSON file or built from defaults. Every field has a
//! default so partial files are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::MAX_SGL;
use crate::error::ConfigError;

/// Adaptive interrupt moderation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModerationConfig {
    pub adaptive: bool,
    /// Interval levels in microseconds, ascending. First entry is the
    /// floor, last is the ceiling.
    pub profile_usecs: Vec<u32>,
    /// Smoothed packets per interrupt needed to reach each level.
    pub packet_thresholds: Vec<u32>,
    /// Smoothed bytes per interrupt needed to reach each level.
    pub byte_thresholds: Vec<u64>,
    /// New samples are weighted 1 / 2^smoothing_shift.
    pub smoothing_shift: u32,
    pub rx_static_usecs: u32,
    pub tx_static_usecs: u32,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            profile_usecs: vec![1, 8, 64, 128, 256],
            packet_thresholds: vec![0, 4, 16, 64, 128],
            byte_thresholds: vec![0, 8 * 1024, 32 * 1024, 128 * 1024, 256 * 1024],
            smoothing_shift: 2,
            rx_static_usecs: 0,
            tx_static_usecs: 64,
        }
    }
}

/// Watchdog thresholds. Timeouts of `None` disable the check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub service_interval_ms: u64,
    pub missing_tx_timeout_ms: Option<u64>,
    /// Outstanding past this many timeouts counts as a stall.
    pub stall_multiple: u32,
    pub missed_tx_threshold: u32,
    pub keep_alive_timeout_ms: Option<u64>,
    pub max_no_interrupt_ticks: u32,
    pub monitored_queues_per_tick: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            service_interval_ms: 1000,
            missing_tx_timeout_ms: Some(5000),
            stall_multiple: 2,
            missed_tx_threshold: 128,
            keep_alive_timeout_ms: Some(6000),
            max_no_interrupt_ticks: 3,
            monitored_queues_per_tick: 4,
        }
    }
}

impl HealthConfig {
    pub fn service_interval(&self) -> Duration {
        Duration::from_millis(self.service_interval_ms)
    }

    pub fn missing_tx_timeout(&self) -> Option<Duration> {
        self.missing_tx_timeout_ms.map(Duration::from_millis)
    }

    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub num_queues: u16,
    pub tx_ring_size: u16,
    pub rx_ring_size: u16,
    /// Ring sizes never shrink below this during creation backoff.
    pub min_ring_size: u16,
    pub max_segments: u16,
    pub rx_copybreak: u32,
    pub rx_headroom: u32,
    pub page_size: u32,
    /// Receive pool size; derived from queue and ring sizes when absent.
    pub rx_pool_pages: Option<usize>,
    pub rx_refill_divider: u16,
    pub rx_refill_max: u16,
    pub max_rx_offset_shift: u16,
    pub tx_poll_divider: u16,
    pub poll_budget: u32,
    pub mtu: u32,
    pub numa_node: Option<u32>,
    pub redirect_queues: bool,
    pub moderation: ModerationConfig,
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_queues: 4,
            tx_ring_size: 1024,
            rx_ring_size: 1024,
            min_ring_size: 256,
            max_segments: 17,
            rx_copybreak: 256,
            rx_headroom: 256,
            page_size: 4096,
            rx_pool_pages: None,
            rx_refill_divider: 8,
            rx_refill_max: 256,
            max_rx_offset_shift: 128,
            tx_poll_divider: 4,
            poll_budget: 64,
            mtu: 1500,
            numa_node: None,
            redirect_queues: true,
            moderation: ModerationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Receive pages needed to fill every ring twice over.
    pub fn pool_pages(&self) -> usize {
        self.rx_pool_pages
            .unwrap_or(self.num_queues as usize * self.rx_ring_size as usize * 2 + 256)
    }

    /// Bytes the device may write into one receive buffer.
    pub fn rx_buffer_len(&self) -> usize {
        self.page_size.saturating_sub(self.rx_headroom) as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.num_queues == 0 {
            return invalid("num_queues must be at least 1".into());
        }
        for (name, size) in [
            ("tx_ring_size", self.tx_ring_size),
            ("rx_ring_size", self.rx_ring_size),
            ("min_ring_size", self.min_ring_size),
        ] {
            if size < 8 || !size.is_power_of_two() {
                return invalid(format!("{name} must be a power of two >= 8, got {size}"));
            }
        }
        if self.min_ring_size > self.tx_ring_size || self.min_ring_size > self.rx_ring_size {
            return invalid("min_ring_size exceeds a configured ring size".into());
        }
        if self.max_segments == 0 || self.max_segments as usize > MAX_SGL - 2 {
            return invalid(format!(
                "max_segments must be within 1..={}, got {}",
                MAX_SGL - 2,
                self.max_segments
            ));
        }
        if self.tx_ring_size < self.max_segments + 2 {
            return invalid("tx_ring_size cannot hold one maximal packet".into());
        }
        if self.rx_headroom + self.rx_copybreak >= self.page_size {
            return invalid("page_size must exceed rx_headroom + rx_copybreak".into());
        }
        if self.rx_refill_divider == 0 || self.tx_poll_divider == 0 {
            return invalid("dividers must be non-zero".into());
        }
        if self.poll_budget == 0 {
            return invalid("poll_budget must be non-zero".into());
        }
        if self.pool_pages() < self.num_queues as usize * self.rx_ring_size as usize {
            return invalid("rx_pool_pages cannot fill every receive ring".into());
        }

        let m = &self.moderation;
        if m.profile_usecs.is_empty() {
            return invalid("moderation profile is empty".into());
        }
        if m.profile_usecs.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("moderation profile must be strictly ascending".into());
        }
        if m.packet_thresholds.len() != m.profile_usecs.len()
            || m.byte_thresholds.len() != m.profile_usecs.len()
        {
            return invalid("moderation thresholds must match profile length".into());
        }
        if m.smoothing_shift > 16 {
            return invalid("smoothing_shift must be <= 16".into());
        }

        if self.health.service_interval_ms == 0 {
            return invalid("service_interval_ms must be non-zero".into());
        }
        if self.health.stall_multiple == 0 {
            return invalid("stall_multiple must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"num_queues": 2, "health": {"missed_tx_threshold": 3}}"#)
                .unwrap();
        assert_eq!(config.num_queues, 2);
        assert_eq!(config.tx_ring_size, 1024);
        assert_eq!(config.health.missed_tx_threshold, 3);
        assert_eq!(config.health.keep_alive_timeout_ms, Some(6000));
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        let config = EngineConfig {
            rx_ring_size: 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_descending_profile() {
        let mut config = EngineConfig::default();
        config.moderation.profile_usecs = vec![64, 8, 1, 128, 256];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_null_timeout_disables() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"health": {"missing_tx_timeout_ms": null}}"#).unwrap();
        assert_eq!(config.health.missing_tx_timeout(), None);
    }
}
