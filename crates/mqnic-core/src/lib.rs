//! # MQNIC Core
//!
//! Packet I/O engine for multi-queue network adapters.
//!
//! This crate provides:
//! - Power-of-two descriptor rings with producer/consumer gap accounting
//! - A capacity-bounded free-id pool for out-of-order TX completions
//! - Scatter/gather DMA mapping with per-packet segment budgets
//! - TX drain with doorbell batching and backpressure (stop/wake)
//! - RX refill with buffer recycling and small-packet copy
//! - Completion reconciliation with bounded per-invocation work
//! - Adaptive interrupt moderation per ring
//! - RSS indirection and Toeplitz hashing
//! - Queue pairs with dedicated worker threads, aggregated under an [`Adapter`]
//! - A watchdog timer service for missing completions and reset handling
//!
//! ## Data path
//!
//! ```text
//!   submit(packet)                                   NetStack::deliver(packet)
//!        │                                                     ▲
//!        ▼                                                     │
//!  ┌───────────┐  map   ┌──────────┐  post   ┌────────────┐    │
//!  │  backlog  │ ─────► │DmaMapper │ ──────► │  TX ring   │    │
//!  └───────────┘        └──────────┘         └─────┬──────┘    │
//!                                                  │ doorbell  │
//!  ════════════════════════════ device ════════════╪═══════════╪═════
//!                                                  ▼           │
//!                                          TX completions   RX completions
//!                                                  │           │
//!                                                  ▼           │
//!                                          ┌────────────────────────┐
//!                                          │ reconciler (per queue) │──► refill
//!                                          └────────────────────────┘
//! ```
//!
//! The device itself is reached through the traits in [`device`] and
//! [`dma::DmaBus`]; `mqnic-sim` provides a software implementation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod moderation;
pub mod packet;
pub mod queue;
pub mod ring;
pub mod rss;
pub mod rx;
pub mod stats;
pub mod tx;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod test_support;

pub use adapter::Adapter;
pub use buffer_pool::BufferPool;
pub use config::{AdapterConfig, ModerationConfig, RefillFailurePolicy, WatchdogConfig};
pub use device::{
    AdminChannel, DeviceCapabilities, Direction, HwQueue, HwStats, QueueSpec, RxBufInfo,
    RxCompletion, RxHwQueue, TxHwQueue,
};
pub use dma::{DmaBus, DmaDirection, DmaMapper, DmaMapperSnapshot, DmaMapping, DmaSegment};
pub use error::{
    AdminError, DmaError, EngineError, HwError, ResetReason, Result, RingError, SubmitError,
};
pub use packet::{NetStack, RxPacket, TxPacket};
pub use queue::{PollOutcome, QueuePair};
pub use ring::{DescriptorRing, FreeIdPool};
pub use rss::{RssTable, toeplitz_hash};
pub use stats::AdapterStats;
pub use watchdog::HealthReport;

/// Hardware queue index of the TX queue belonging to queue pair `qid`.
#[inline]
pub const fn io_txq_idx(qid: u16) -> u16 {
    2 * qid
}

/// Hardware queue index of the RX queue belonging to queue pair `qid`.
#[inline]
pub const fn io_rxq_idx(qid: u16) -> u16 {
    2 * qid + 1
}

/// Interrupt vector of queue pair `qid`. Vector 0 belongs to the admin queue.
#[inline]
pub const fn io_irq_idx(qid: u16) -> u16 {
    1 + qid
}
