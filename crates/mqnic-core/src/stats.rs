//! Engine statistics
//!
//! Counters are relaxed atomics updated on the data path; readers take a
//! [`snapshot`](TxStats::snapshot) that copies every counter into a plain
//! struct.

use crate::device::{Direction, HwStats};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counter_group {
    (
        $(#[$meta:meta])*
        $name:ident => $snap:ident {
            $( $(#[$fmeta:meta])* $field:ident ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $( $(#[$fmeta])* pub(crate) $field: AtomicU64, )*
        }

        impl $name {
            /// Create zeroed counters
            pub fn new() -> Self {
                Self::default()
            }

            /// Copy every counter
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                }
            }

            /// Zero every counter
            pub fn reset(&self) {
                $( self.$field.store(0, Ordering::Relaxed); )*
            }
        }

        #[doc = concat!("Point-in-time copy of [`", stringify!($name), "`]")]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $snap {
            $( $(#[$fmeta])* pub $field: u64, )*
        }
    };
}

counter_group! {
    /// Per-ring transmit counters
    TxStats => TxStatsSnapshot {
        /// Packets completed by the device
        packets,
        /// Bytes completed by the device
        bytes,
        /// Ring ran out of slots or request ids
        queue_stop,
        /// Stopped ring resumed after reclamation
        queue_wakeup,
        /// Device rejected descriptors
        prepare_ctx_err,
        /// Mapping failed; packet dropped
        dma_mapping_err,
        /// Packet exceeded the segment budget even after coalescing
        too_many_frags,
        /// Doorbells rung
        doorbells,
        /// Descriptors outstanding beyond the missing-completion timeout
        missing_tx_comp,
        /// Completions naming no outstanding request
        bad_req_id,
        /// Submissions rejected because the backlog was full
        backlog_full,
        /// Backlog entries dropped at deactivation
        backlog_dropped,
    }
}

counter_group! {
    /// Per-ring receive counters
    RxStats => RxStatsSnapshot {
        /// Packets delivered to the network stack
        packets,
        /// Bytes delivered to the network stack
        bytes,
        /// Refill cycles that could not fill the gap
        refill_partial,
        /// Buffer allocations that failed
        alloc_fail,
        /// Buffer mappings that failed
        dma_mapping_err,
        /// Completions with an impossible descriptor count
        bad_desc_num,
        /// Completions whose request id did not match the expected slot
        bad_req_id,
        /// Packets copied out so their buffer could be recycled
        small_copy_len_pkt,
    }
}

counter_group! {
    /// Adapter-wide counters
    DevStats => DevStatsSnapshot {
        /// Successful activations
        interface_up,
        /// Deactivations
        interface_down,
        /// Watchdog detected a fault
        wd_expired,
        /// Device resets performed
        resets,
    }
}

#[inline]
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl TxStats {
    /// Record completed transmissions
    pub fn record_tx(&self, count: u64, bytes: u64) {
        add(&self.packets, count);
        add(&self.bytes, bytes);
    }
}

impl RxStats {
    /// Record delivered packets
    pub fn record_rx(&self, count: u64, bytes: u64) {
        add(&self.packets, count);
        add(&self.bytes, bytes);
    }
}

/// State of one TX ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRingSnapshot {
    /// Queue pair id
    pub qid: u16,
    /// Ring size
    pub size: usize,
    /// Producer index
    pub next_to_use: usize,
    /// Consumer index
    pub next_to_clean: usize,
    /// Descriptors still owned by the device
    pub outstanding: usize,
    /// Free request ids
    pub free_ids: usize,
    /// Packets waiting in the software backlog
    pub backlog: usize,
    /// Ring is stopped waiting for completions
    pub stopped: bool,
    /// Programmed interrupt interval
    pub interval_usecs: u32,
    /// Counters
    pub stats: TxStatsSnapshot,
}

/// State of one RX ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxRingSnapshot {
    /// Queue pair id
    pub qid: u16,
    /// Ring size
    pub size: usize,
    /// Producer index
    pub next_to_use: usize,
    /// Consumer index
    pub next_to_clean: usize,
    /// Buffers posted to the device
    pub posted: usize,
    /// Mapped buffers waiting to be reposted
    pub recycled: usize,
    /// Programmed interrupt interval
    pub interval_usecs: u32,
    /// Counters
    pub stats: RxStatsSnapshot,
}

/// State of one ring, either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingSnapshot {
    /// Transmit ring
    Tx(TxRingSnapshot),
    /// Receive ring
    Rx(RxRingSnapshot),
}

impl RingSnapshot {
    /// Queue pair id
    pub fn qid(&self) -> u16 {
        match self {
            Self::Tx(s) => s.qid,
            Self::Rx(s) => s.qid,
        }
    }

    /// Ring direction
    pub fn direction(&self) -> Direction {
        match self {
            Self::Tx(_) => Direction::Tx,
            Self::Rx(_) => Direction::Rx,
        }
    }
}

/// Adapter statistics report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    /// Adapter-wide counters
    pub dev: DevStatsSnapshot,
    /// Last hardware counters read from the device
    pub hw: HwStats,
    /// One entry per ring, TX before RX for each queue pair
    pub rings: Vec<RingSnapshot>,
}

impl AdapterStats {
    /// Sum of TX counters over every ring
    pub fn tx_total(&self) -> TxStatsSnapshot {
        self.rings
            .iter()
            .filter_map(|r| match r {
                RingSnapshot::Tx(s) => Some(&s.stats),
                RingSnapshot::Rx(_) => None,
            })
            .fold(TxStatsSnapshot::default(), |mut acc, s| {
                acc.packets += s.packets;
                acc.bytes += s.bytes;
                acc.queue_stop += s.queue_stop;
                acc.queue_wakeup += s.queue_wakeup;
                acc.prepare_ctx_err += s.prepare_ctx_err;
                acc.dma_mapping_err += s.dma_mapping_err;
                acc.too_many_frags += s.too_many_frags;
                acc.doorbells += s.doorbells;
                acc.missing_tx_comp += s.missing_tx_comp;
                acc.bad_req_id += s.bad_req_id;
                acc.backlog_full += s.backlog_full;
                acc.backlog_dropped += s.backlog_dropped;
                acc
            })
    }

    /// Sum of RX counters over every ring
    pub fn rx_total(&self) -> RxStatsSnapshot {
        self.rings
            .iter()
            .filter_map(|r| match r {
                RingSnapshot::Rx(s) => Some(&s.stats),
                RingSnapshot::Tx(_) => None,
            })
            .fold(RxStatsSnapshot::default(), |mut acc, s| {
                acc.packets += s.packets;
                acc.bytes += s.bytes;
                acc.refill_partial += s.refill_partial;
                acc.alloc_fail += s.alloc_fail;
                acc.dma_mapping_err += s.dma_mapping_err;
                acc.bad_desc_num += s.bad_desc_num;
                acc.bad_req_id += s.bad_req_id;
                acc.small_copy_len_pkt += s.small_copy_len_pkt;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_snapshot_and_reset() {
        let stats = TxStats::new();
        stats.record_tx(3, 4500);
        inc(&stats.queue_stop);
        inc(&stats.queue_stop);

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 3);
        assert_eq!(snap.bytes, 4500);
        assert_eq!(snap.queue_stop, 2);
        assert_eq!(snap.bad_req_id, 0);

        stats.reset();
        assert_eq!(stats.snapshot(), TxStatsSnapshot::default());
    }

    #[test]
    fn test_adapter_totals() {
        let tx = |packets| {
            RingSnapshot::Tx(TxRingSnapshot {
                qid: 0,
                size: 8,
                next_to_use: 0,
                next_to_clean: 0,
                outstanding: 0,
                free_ids: 8,
                backlog: 0,
                stopped: false,
                interval_usecs: 0,
                stats: TxStatsSnapshot {
                    packets,
                    ..Default::default()
                },
            })
        };
        let rx = RingSnapshot::Rx(RxRingSnapshot {
            qid: 1,
            size: 8,
            next_to_use: 7,
            next_to_clean: 0,
            posted: 7,
            recycled: 0,
            interval_usecs: 0,
            stats: RxStatsSnapshot {
                bad_desc_num: 2,
                ..Default::default()
            },
        });

        let report = AdapterStats {
            rings: vec![tx(5), rx.clone(), tx(7)],
            ..Default::default()
        };
        assert_eq!(report.tx_total().packets, 12);
        assert_eq!(report.rx_total().bad_desc_num, 2);
        assert_eq!(rx.direction(), Direction::Rx);
        assert_eq!(rx.qid(), 1);
    }
}
