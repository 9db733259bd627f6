//! Adapter configuration
//!
//! Configuration is plain data with serde support so it can be loaded from a
//! TOML file. Every field has a default; a file only needs the keys it
//! overrides:
//!
//! ```toml
//! num_queues = 4
//! rx_ring_size = 2048
//! mtu = 9000
//!
//! [moderation]
//! adaptive = true
//! levels_usecs = [0, 32, 96, 256]
//!
//! [refill_failure_policy]
//! mode = "reset_after"
//! consecutive_failures = 16
//! ```

use crate::device::DeviceCapabilities;
use crate::error::{EngineError, Result};
use crate::ring::MAX_RING_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest MTU accepted (IPv4 minimum)
pub const MIN_MTU: u32 = 68;

/// Largest MTU accepted
pub const MAX_MTU: u32 = 9216;

/// Upper bound on TX segments per packet
pub const MAX_PKT_BUFS: usize = 19;

/// Ethernet header + VLAN tag + FCS on top of the MTU
pub const ETH_OVERHEAD: usize = 18;

/// RX buffer size bounds when derived from the MTU
pub const MIN_RX_BUF_SIZE: usize = 600;
/// See [`MIN_RX_BUF_SIZE`]
pub const MAX_RX_BUF_SIZE: usize = 1536;

const MIN_RING_SIZE: u32 = 8;

/// What RX refill does when buffers cannot be allocated or mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RefillFailurePolicy {
    /// Count the failure and retry on the next refill cycle
    RetryForever,
    /// Request an adapter reset once the ring ran empty and refill failed
    /// this many times in a row
    ResetAfter {
        /// Consecutive failed refill cycles tolerated
        consecutive_failures: u32,
    },
}

impl Default for RefillFailurePolicy {
    fn default() -> Self {
        Self::RetryForever
    }
}

/// Interrupt moderation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Adapt intervals to traffic; otherwise program the static intervals once
    pub adaptive: bool,
    /// Interval of each level in microseconds, lowest first
    pub levels_usecs: Vec<u32>,
    /// Busy batches in a row required before moving up a level
    pub up_after_batches: u32,
    /// EWMA weight as a power of two (new sample weighs `1 / 2^shift`)
    pub ewma_shift: u32,
    /// Static TX interval when adaptation is off
    pub tx_usecs: u32,
    /// Static RX interval when adaptation is off
    pub rx_usecs: u32,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            levels_usecs: vec![0, 64, 128, 256, 512],
            up_after_batches: 50,
            ewma_shift: 3,
            tx_usecs: 50,
            rx_usecs: 20,
        }
    }
}

/// Timer service settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Run the timer service
    pub enabled: bool,
    /// Health check period in milliseconds
    pub interval_ms: u64,
    /// Age after which an outstanding TX descriptor counts as missing
    pub missing_tx_timeout_ms: u64,
    /// Missing descriptors on one ring that trigger a reset
    pub missing_tx_threshold: usize,
    /// How long deactivation waits for TX completions
    pub shutdown_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            missing_tx_timeout_ms: 5_000,
            missing_tx_threshold: 128,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl WatchdogConfig {
    /// Health check period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Missing TX completion timeout
    pub fn missing_tx_timeout(&self) -> Duration {
        Duration::from_millis(self.missing_tx_timeout_ms)
    }

    /// Deactivation drain timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Queue pairs to create; 0 picks `min(cpus, device maximum)`
    pub num_queues: u16,
    /// TX descriptor ring size (power of two)
    pub tx_ring_size: u32,
    /// RX descriptor ring size (power of two)
    pub rx_ring_size: u32,
    /// Maximum transmission unit
    pub mtu: u32,
    /// Software TX backlog depth per queue
    pub tx_backlog: usize,
    /// TX descriptors posted between doorbells
    pub doorbell_threshold: u32,
    /// RX packets processed per poll
    pub rx_budget: usize,
    /// Packets up to this size are copied and their buffer recycled
    pub rx_small_copy_len: usize,
    /// Refill runs once more than `rx_ring_size / refill_divider` slots are free
    pub refill_divider: u32,
    /// RX buffer size; derived from the MTU when unset
    pub rx_buf_size: Option<usize>,
    /// Cached RX buffers per queue
    pub rx_pool_size: usize,
    /// TX segment ceiling per packet (further capped by the device)
    pub max_tx_segments: usize,
    /// Largest single DMA segment
    pub max_segment_size: usize,
    /// One worker thread per queue pair; otherwise interrupts are polled inline
    pub dedicated_workers: bool,
    /// Depth of each worker's event channel
    pub event_queue_depth: usize,
    /// Interrupt moderation
    pub moderation: ModerationConfig,
    /// Timer service
    pub watchdog: WatchdogConfig,
    /// RX refill failure handling
    pub refill_failure_policy: RefillFailurePolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            num_queues: 0,
            tx_ring_size: 1024,
            rx_ring_size: 1024,
            mtu: 1500,
            tx_backlog: 4096,
            doorbell_threshold: 16,
            rx_budget: 256,
            rx_small_copy_len: 128,
            refill_divider: 8,
            rx_buf_size: None,
            rx_pool_size: 256,
            max_tx_segments: MAX_PKT_BUFS,
            max_segment_size: 4096,
            dedicated_workers: true,
            event_queue_depth: 64,
            moderation: ModerationConfig::default(),
            watchdog: WatchdogConfig::default(),
            refill_failure_policy: RefillFailurePolicy::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig(msg.into())
}

impl AdapterConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }

    /// RX buffer size in bytes
    pub fn rx_buf_size(&self) -> usize {
        self.rx_buf_size.unwrap_or_else(|| {
            (self.mtu as usize + ETH_OVERHEAD).clamp(MIN_RX_BUF_SIZE, MAX_RX_BUF_SIZE)
        })
    }

    /// Number of queue pairs to bring up on a device with `caps`
    pub fn effective_queue_count(&self, caps: &DeviceCapabilities) -> u16 {
        if self.num_queues == 0 {
            let cpus = u16::try_from(num_cpus::get()).unwrap_or(u16::MAX);
            cpus.min(caps.max_queues).max(1)
        } else {
            self.num_queues
        }
    }

    /// TX segments allowed per packet on a device with `caps`
    pub fn tx_segment_budget(&self, caps: &DeviceCapabilities) -> usize {
        self.max_tx_segments.min(usize::from(caps.max_tx_sgl)).max(1)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("tx_ring_size", self.tx_ring_size),
            ("rx_ring_size", self.rx_ring_size),
        ] {
            if !size.is_power_of_two() {
                return Err(invalid(format!("{name} must be power of 2")));
            }
            if !(MIN_RING_SIZE..=MAX_RING_SIZE as u32).contains(&size) {
                return Err(invalid(format!(
                    "{name} must be in {MIN_RING_SIZE}..={MAX_RING_SIZE}"
                )));
            }
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(invalid(format!(
                "mtu {} outside {MIN_MTU}..={MAX_MTU}",
                self.mtu
            )));
        }

        if !(1..=MAX_PKT_BUFS).contains(&self.max_tx_segments) {
            return Err(invalid(format!(
                "max_tx_segments must be in 1..={MAX_PKT_BUFS}"
            )));
        }

        if self.max_segment_size == 0 || self.max_segment_size > u32::MAX as usize {
            return Err(invalid("max_segment_size must be non-zero and fit in 32 bits"));
        }

        if self.tx_backlog == 0 {
            return Err(invalid("tx_backlog must be non-zero"));
        }
        if self.doorbell_threshold == 0 {
            return Err(invalid("doorbell_threshold must be non-zero"));
        }
        if self.rx_budget == 0 {
            return Err(invalid("rx_budget must be non-zero"));
        }
        if self.event_queue_depth == 0 {
            return Err(invalid("event_queue_depth must be non-zero"));
        }
        if self.refill_divider == 0 || self.refill_divider > self.rx_ring_size {
            return Err(invalid("refill_divider must be in 1..=rx_ring_size"));
        }

        let buf = self.rx_buf_size();
        if buf < 64 || buf > usize::from(u16::MAX) {
            return Err(invalid(format!("rx_buf_size {buf} must be in 64..=65535")));
        }
        if buf > self.max_segment_size {
            return Err(invalid(format!(
                "rx_buf_size {buf} exceeds max_segment_size {}",
                self.max_segment_size
            )));
        }
        if self.rx_small_copy_len > buf {
            return Err(invalid("rx_small_copy_len must not exceed rx_buf_size"));
        }

        let levels = &self.moderation.levels_usecs;
        if levels.is_empty() {
            return Err(invalid("moderation.levels_usecs must not be empty"));
        }
        if levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("moderation.levels_usecs must be strictly increasing"));
        }
        if self.moderation.up_after_batches == 0 {
            return Err(invalid("moderation.up_after_batches must be non-zero"));
        }
        if self.moderation.ewma_shift > 16 {
            return Err(invalid("moderation.ewma_shift must be at most 16"));
        }

        if self.watchdog.interval_ms == 0 {
            return Err(invalid("watchdog.interval_ms must be non-zero"));
        }
        if self.watchdog.shutdown_timeout_ms == 0 {
            return Err(invalid("watchdog.shutdown_timeout_ms must be non-zero"));
        }

        if let RefillFailurePolicy::ResetAfter {
            consecutive_failures: 0,
        } = self.refill_failure_policy
        {
            return Err(invalid("refill_failure_policy.consecutive_failures must be non-zero"));
        }

        Ok(())
    }

    /// Check the configuration against device limits
    pub fn validate_against(&self, caps: &DeviceCapabilities) -> Result<()> {
        self.validate()?;

        if caps.max_queues == 0 || caps.max_tx_sgl == 0 || caps.max_rx_sgl == 0 {
            return Err(invalid(format!("device advertises unusable limits: {caps:?}")));
        }

        if self.num_queues > caps.max_queues {
            return Err(invalid(format!(
                "num_queues {} exceeds device maximum {}",
                self.num_queues, caps.max_queues
            )));
        }

        for (name, size) in [
            ("tx_ring_size", self.tx_ring_size),
            ("rx_ring_size", self.rx_ring_size),
        ] {
            if size > caps.max_ring_size {
                return Err(invalid(format!(
                    "{name} {size} exceeds device maximum {}",
                    caps.max_ring_size
                )));
            }
        }

        if self.mtu > caps.max_mtu {
            return Err(invalid(format!(
                "mtu {} exceeds device maximum {}",
                self.mtu, caps.max_mtu
            )));
        }

        let frame = self.mtu as usize + ETH_OVERHEAD;
        let max_rx = self.rx_buf_size() * usize::from(caps.max_rx_sgl);
        if frame > max_rx {
            return Err(invalid(format!(
                "frame size {frame} does not fit in {} RX buffers of {} bytes",
                caps.max_rx_sgl,
                self.rx_buf_size()
            )));
        }

        Ok(())
    }
}
