//! Device-facing interfaces
//!
//! The engine never touches registers directly. It drives the device through
//! an [`AdminChannel`] for control-path commands and per-queue
//! [`TxHwQueue`]/[`RxHwQueue`] handles for the data path.

use crate::dma::DmaSegment;
use crate::error::{AdminError, HwError};

/// Queue direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Transmit
    Tx,
    /// Receive
    Rx,
}

/// Parameters of a hardware queue creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue direction
    pub direction: Direction,
    /// Hardware queue index (TX = 2 × qid, RX = 2 × qid + 1)
    pub hw_index: u16,
    /// Descriptor ring depth
    pub depth: u32,
    /// CPU affinity hint
    pub cpu: usize,
    /// Interrupt vector
    pub vector: u16,
}

/// Limits advertised by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Maximum number of queue pairs
    pub max_queues: u16,
    /// Maximum TX scatter/gather entries per packet
    pub max_tx_sgl: u16,
    /// Maximum RX buffers per received packet
    pub max_rx_sgl: u16,
    /// Largest supported MTU
    pub max_mtu: u32,
    /// Largest supported ring depth
    pub max_ring_size: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_queues: 8,
            max_tx_sgl: 19,
            max_rx_sgl: 19,
            max_mtu: 9216,
            max_ring_size: 8192,
        }
    }
}

/// Hardware traffic counters reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwStats {
    /// Packets received by the device
    pub rx_packets: u64,
    /// Bytes received by the device
    pub rx_bytes: u64,
    /// Packets transmitted by the device
    pub tx_packets: u64,
    /// Bytes transmitted by the device
    pub tx_bytes: u64,
    /// Packets dropped for lack of posted RX buffers
    pub rx_drops: u64,
}

/// One buffer of a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxBufInfo {
    /// Request id of the posted buffer
    pub req_id: u16,
    /// Bytes written into it
    pub len: u16,
}

/// A received packet as reported by the RX completion queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxCompletion {
    /// Buffers holding the packet, in ring order
    pub bufs: Vec<RxBufInfo>,
    /// RSS hash computed by the device
    pub hash: u32,
}

/// Data-path handle of a transmit queue
pub trait TxHwQueue: Send {
    /// Hardware queue index
    fn hw_index(&self) -> u16;

    /// Write the descriptors of one packet
    fn write_descriptors(&mut self, req_id: u16, segments: &[DmaSegment]) -> Result<(), HwError>;

    /// Notify the device of newly written descriptors
    fn ring_doorbell(&mut self);

    /// Pop the next completed request id
    fn next_completion(&mut self) -> Option<u16>;

    /// Program the interrupt coalescing interval in microseconds
    fn set_interrupt_interval(&mut self, usecs: u32);
}

/// Data-path handle of a receive queue
pub trait RxHwQueue: Send {
    /// Hardware queue index
    fn hw_index(&self) -> u16;

    /// Post one empty buffer
    fn write_descriptor(&mut self, req_id: u16, segment: DmaSegment) -> Result<(), HwError>;

    /// Notify the device of newly posted buffers
    fn ring_doorbell(&mut self);

    /// Pop the next received packet
    fn next_packet(&mut self) -> Option<RxCompletion>;

    /// Program the interrupt coalescing interval in microseconds
    fn set_interrupt_interval(&mut self, usecs: u32);
}

/// A created hardware queue
pub enum HwQueue {
    /// Transmit queue
    Tx(Box<dyn TxHwQueue>),
    /// Receive queue
    Rx(Box<dyn RxHwQueue>),
}

impl HwQueue {
    /// Queue direction
    pub fn direction(&self) -> Direction {
        match self {
            Self::Tx(_) => Direction::Tx,
            Self::Rx(_) => Direction::Rx,
        }
    }

    /// Hardware queue index
    pub fn hw_index(&self) -> u16 {
        match self {
            Self::Tx(q) => q.hw_index(),
            Self::Rx(q) => q.hw_index(),
        }
    }
}

impl std::fmt::Debug for HwQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwQueue")
            .field("direction", &self.direction())
            .field("hw_index", &self.hw_index())
            .finish()
    }
}

/// Administrative command channel
pub trait AdminChannel: Send + Sync {
    /// Query device limits
    fn get_capabilities(&self) -> Result<DeviceCapabilities, AdminError>;

    /// Create a hardware queue
    fn create_queue(&self, spec: &QueueSpec) -> Result<HwQueue, AdminError>;

    /// Destroy a hardware queue
    fn destroy_queue(&self, queue: HwQueue) -> Result<(), AdminError>;

    /// Upload the RSS indirection table
    fn set_rss_indirection(&self, table: &[u16]) -> Result<(), AdminError>;

    /// Set the device MTU
    fn set_mtu(&self, mtu: u32) -> Result<(), AdminError>;

    /// Reset the device, dropping every queue it owns
    fn reset_device(&self) -> Result<(), AdminError>;

    /// Read hardware traffic counters
    fn get_hw_stats(&self) -> Result<HwStats, AdminError>;
}
