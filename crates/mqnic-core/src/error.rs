//! Error types for the packet I/O engine

use crate::packet::TxPacket;
use std::time::Duration;
use thiserror::Error;

/// Descriptor ring errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free slots; the caller should back off and retry later
    #[error("Ring full")]
    RingFull,

    /// Ring size is not a usable power of two
    #[error("Invalid ring size {0}: must be a power of two in 2..=32768")]
    InvalidSize(usize),

    /// Ring indices violate the occupancy invariant
    #[error("Ring index corruption: {0}")]
    Corrupted(String),
}

/// DMA mapping errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// Buffer needs more segments than the device accepts per packet
    #[error("Too many fragments: {segments} segments, at most {max} allowed")]
    TooManyFragments {
        /// Segments the buffer would need
        segments: usize,
        /// Per-packet ceiling
        max: usize,
    },

    /// The bus could not map the region (e.g. IOMMU exhaustion)
    #[error("DMA mapping failed: {0}")]
    Mapping(String),
}

/// Administrative command channel errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// Command not supported by the device
    #[error("Admin command unsupported: {0}")]
    Unsupported(String),

    /// Command rejected or failed
    #[error("Admin command failed: {0}")]
    Failed(String),

    /// Device did not answer in time
    #[error("Admin command timed out")]
    Timeout,
}

/// Errors reported by a hardware queue when writing descriptors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HwError {
    /// Device submission queue has no room for the descriptors
    #[error("No space in device submission queue")]
    NoSpace,

    /// Descriptor preparation failed
    #[error("Descriptor preparation failed: {0}")]
    Failed(String),
}

/// Why an adapter reset was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// TX completions did not arrive in time
    MissingTxCompletions {
        /// Queue pair id
        queue: u16,
    },
    /// Ring indices violated the occupancy invariant
    RingCorruption {
        /// Queue pair id
        queue: u16,
    },
    /// Device reported an impossible RX descriptor count
    InvalidRxDescriptors {
        /// Queue pair id
        queue: u16,
    },
    /// RX refill failed persistently while the ring ran empty
    RxStarvation {
        /// Queue pair id
        queue: u16,
    },
    /// Shutdown could not drain outstanding TX descriptors
    DrainTimeout {
        /// Queue pair id
        queue: u16,
    },
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTxCompletions { queue } => {
                write!(f, "missing TX completions on queue {queue}")
            }
            Self::RingCorruption { queue } => write!(f, "ring corruption on queue {queue}"),
            Self::InvalidRxDescriptors { queue } => {
                write!(f, "invalid RX descriptor count on queue {queue}")
            }
            Self::RxStarvation { queue } => write!(f, "RX refill starvation on queue {queue}"),
            Self::DrainTimeout { queue } => write!(f, "drain timeout on queue {queue}"),
        }
    }
}

/// Transmit submission rejected; the packet is handed back to the caller
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Backlog is full; retry after completions free space
    #[error("Ring full")]
    RingFull(TxPacket),

    /// Queue is not accepting packets (adapter down or queue stopping)
    #[error("Queue down")]
    QueueDown(TxPacket),
}

impl SubmitError {
    /// Recover the rejected packet
    pub fn into_packet(self) -> TxPacket {
        match self {
            Self::RingFull(p) | Self::QueueDown(p) => p,
        }
    }
}

/// Errors that can occur in engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Descriptor ring error
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    /// DMA mapping error
    #[error("DMA error: {0}")]
    Dma(#[from] DmaError),

    /// Admin channel error
    #[error("Admin error: {0}")]
    Admin(#[from] AdminError),

    /// Completion named a request id with no outstanding transmission
    #[error("Bad request id {req_id} on queue {queue}")]
    BadRequestId {
        /// Queue pair id
        queue: u16,
        /// Offending request id
        req_id: u16,
    },

    /// TX descriptor outstanding for longer than the watchdog timeout
    #[error("Missing completion for request id {req_id} on queue {queue} after {elapsed:?}")]
    MissingCompletion {
        /// Queue pair id
        queue: u16,
        /// Request id still owned by the device
        req_id: u16,
        /// Time since the descriptor was posted
        elapsed: Duration,
    },

    /// Outstanding TX descriptors did not drain before the shutdown timeout
    #[error("Queue {queue} failed to drain {outstanding} descriptors; device reset performed")]
    DrainTimeout {
        /// Queue pair id
        queue: u16,
        /// Descriptors still device-owned at the deadline
        outstanding: usize,
    },

    /// A condition that requires a full device reset
    #[error("Device reset required: {0}")]
    ResetRequired(ResetReason),

    /// Operation needs an active adapter
    #[error("Adapter is not active")]
    NotActive,

    /// Adapter is already active
    #[error("Adapter is already active")]
    AlreadyActive,

    /// No queue pair with this id
    #[error("Unknown queue {0}")]
    UnknownQueue(u16),

    /// I/O error (configuration loading)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
