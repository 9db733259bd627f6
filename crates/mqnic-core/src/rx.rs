//! Receive ring
//!
//! Empty buffers are posted with their ring position as request id, so the
//! device must hand them back strictly in ring order. A received packet may
//! span several buffers; they are reassembled and delivered once.
//!
//! Small packets are copied into a fresh allocation and their still-mapped
//! buffer goes onto a recycle list, which refill drains before allocating.

use crate::buffer_pool::BufferPool;
use crate::config::{ModerationConfig, RefillFailurePolicy};
use crate::device::{Direction, RxHwQueue};
use crate::dma::{DmaDirection, DmaMapper, DmaMapping};
use crate::error::{EngineError, ResetReason, RingError};
use crate::moderation::ModerationController;
use crate::packet::{NetStack, RxPacket};
use crate::ring::DescriptorRing;
use crate::stats::{RxRingSnapshot, RxStats, inc};
use parking_lot::Mutex;
use std::sync::Arc;

/// A posted receive buffer
struct RxBuffer {
    data: Vec<u8>,
    mapping: DmaMapping,
}

struct RxState {
    ring: DescriptorRing<RxBuffer>,
    hw: Option<Box<dyn RxHwQueue>>,
    recycled: Vec<RxBuffer>,
    moderation: ModerationController,
    interval_usecs: u32,
    refill_failures: u32,
}

/// Receive path tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxParams {
    /// Packets processed per clean
    pub budget: usize,
    /// Copy packets up to this size and recycle their buffer
    pub small_copy_len: usize,
    /// Refill once more than `size / refill_divider` slots are free
    pub refill_divider: usize,
    /// Most buffers one packet may span
    pub max_rx_sgl: usize,
    /// What to do when refill keeps failing
    pub refill_failure_policy: RefillFailurePolicy,
}

impl Default for RxParams {
    fn default() -> Self {
        Self {
            budget: 256,
            small_copy_len: 128,
            refill_divider: 8,
            max_rx_sgl: 19,
            refill_failure_policy: RefillFailurePolicy::RetryForever,
        }
    }
}

/// Result of one RX clean
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxCleanOutcome {
    /// Packets delivered
    pub delivered: usize,
    /// Packets dropped because of bad request ids
    pub dropped: usize,
    /// Budget exhausted; poll again instead of waiting for an interrupt
    pub reschedule: bool,
    /// A condition that requires an adapter reset
    pub reset: Option<ResetReason>,
}

/// Result of one refill cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillOutcome {
    /// Buffers posted
    pub posted: usize,
    /// Set once refill starvation crossed the configured limit
    pub reset: Option<ResetReason>,
}

/// Receive half of a queue pair
pub struct RxRing {
    qid: u16,
    size: usize,
    state: Mutex<RxState>,
    pool: BufferPool,
    mapper: Arc<DmaMapper>,
    stats: RxStats,
    params: RxParams,
}

impl RxRing {
    /// Create a detached RX ring
    pub fn new(
        qid: u16,
        size: usize,
        pool: BufferPool,
        mapper: Arc<DmaMapper>,
        params: RxParams,
        moderation: &ModerationConfig,
    ) -> Result<Self, EngineError> {
        let ring = DescriptorRing::new(size)?;
        let moderation = ModerationController::new(moderation, size, Direction::Rx);
        let interval_usecs = moderation.interval_usecs();

        Ok(Self {
            qid,
            size,
            state: Mutex::new(RxState {
                ring,
                hw: None,
                recycled: Vec::new(),
                moderation,
                interval_usecs,
                refill_failures: 0,
            }),
            pool,
            mapper,
            stats: RxStats::new(),
            params: RxParams {
                budget: params.budget.max(1),
                refill_divider: params.refill_divider.max(1),
                max_rx_sgl: params.max_rx_sgl.max(1),
                ..params
            },
        })
    }

    /// Queue pair id
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Ring size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Counters
    pub fn stats(&self) -> &RxStats {
        &self.stats
    }

    /// Buffers currently posted to the device
    pub fn posted(&self) -> usize {
        self.state.lock().ring.outstanding_count()
    }

    /// Buffer pool backing this ring
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Attach a hardware queue to an empty ring
    ///
    /// The caller fills the ring with [`refill(true)`](Self::refill) afterwards.
    pub fn attach(&self, mut hw: Box<dyn RxHwQueue>) {
        let mut st = self.state.lock();
        st.ring.reset();
        st.refill_failures = 0;
        st.moderation.reset();
        st.interval_usecs = st.moderation.interval_usecs();
        hw.set_interrupt_interval(st.interval_usecs);
        st.hw = Some(hw);
        drop(st);
        tracing::debug!("RX queue {} attached ({} slots)", self.qid, self.size);
    }

    /// Remove the hardware queue handle
    pub fn detach(&self) -> Option<Box<dyn RxHwQueue>> {
        self.state.lock().hw.take()
    }

    /// Post buffers into free slots
    ///
    /// Without `force`, nothing happens unless more than
    /// `size / refill_divider` slots are free. Recycled buffers are posted
    /// before new ones are allocated and mapped (outside the ring lock).
    ///
    /// # Arguments
    ///
    /// * `force` - Fill every free slot regardless of the threshold, as done
    ///   when the queue is first attached
    ///
    /// # Returns
    ///
    /// The number of buffers posted, in [`RefillOutcome::posted`]. A partial refill (allocation or mapping
    /// failure) is counted in `refill_partial` and retried on the next cycle;
    /// with [`RefillFailurePolicy::ResetAfter`] an empty ring that keeps
    /// failing sets [`RefillOutcome::reset`].
    pub fn refill(&self, force: bool) -> RefillOutcome {
        let needed = {
            let st = self.state.lock();
            if st.hw.is_none() {
                return RefillOutcome::default();
            }
            let free = st.ring.free_slots();
            if free == 0 || (!force && free <= self.size / self.params.refill_divider) {
                return RefillOutcome::default();
            }
            free
        };

        let mut posted = {
            let mut st = self.state.lock();
            let mut posted = 0;
            while posted < needed {
                let Some(buffer) = st.recycled.pop() else {
                    break;
                };
                match Self::post_locked(&mut st, buffer) {
                    Ok(()) => posted += 1,
                    Err(buffer) => {
                        st.recycled.push(buffer);
                        break;
                    }
                }
            }
            posted
        };

        let mut fresh = Vec::new();
        let mut failed = false;
        for _ in posted..needed {
            match self.alloc_buffer() {
                Some(buffer) => fresh.push(buffer),
                None => {
                    failed = true;
                    break;
                }
            }
        }

        let mut st = self.state.lock();
        for buffer in fresh {
            match Self::post_locked(&mut st, buffer) {
                Ok(()) => posted += 1,
                Err(buffer) => st.recycled.push(buffer),
            }
        }

        if posted > 0 {
            if let Some(hw) = st.hw.as_mut() {
                hw.ring_doorbell();
            }
        }

        let mut reset = None;
        if failed {
            inc(&self.stats.refill_partial);
            st.refill_failures = st.refill_failures.saturating_add(1);
            tracing::debug!(
                "RX queue {} refilled {} of {} buffers",
                self.qid,
                posted,
                needed
            );

            if let RefillFailurePolicy::ResetAfter {
                consecutive_failures,
            } = self.params.refill_failure_policy
            {
                if st.refill_failures >= consecutive_failures && st.ring.is_empty() {
                    tracing::error!(
                        "RX queue {} starved after {} failed refills",
                        self.qid,
                        st.refill_failures
                    );
                    reset = Some(ResetReason::RxStarvation { queue: self.qid });
                }
            }
        } else {
            st.refill_failures = 0;
        }

        RefillOutcome { posted, reset }
    }

    fn alloc_buffer(&self) -> Option<RxBuffer> {
        let data = match self.pool.try_acquire() {
            Ok(data) => data,
            Err(e) => {
                inc(&self.stats.alloc_fail);
                tracing::debug!("RX queue {} buffer allocation failed: {}", self.qid, e);
                return None;
            }
        };

        match self.mapper.map(&data, DmaDirection::FromDevice) {
            Ok(mapping) if mapping.segments().len() == 1 => Some(RxBuffer { data, mapping }),
            Ok(mapping) => {
                inc(&self.stats.dma_mapping_err);
                tracing::warn!(
                    "RX queue {} buffer needs {} segments",
                    self.qid,
                    mapping.segments().len()
                );
                self.pool.release(data);
                None
            }
            Err(e) => {
                inc(&self.stats.dma_mapping_err);
                tracing::debug!("RX queue {} buffer mapping failed: {}", self.qid, e);
                self.pool.release(data);
                None
            }
        }
    }

    fn post_locked(st: &mut RxState, buffer: RxBuffer) -> Result<(), RxBuffer> {
        if st.hw.is_none() {
            return Err(buffer);
        }
        let Some(&segment) = buffer.mapping.segments().first() else {
            return Err(buffer);
        };
        let pos = st.ring.post(buffer).map_err(|(_, buffer)| buffer)?;

        let written = match st.hw.as_mut() {
            Some(hw) => hw.write_descriptor(pos as u16, segment),
            None => Ok(()),
        };
        if written.is_err() {
            // Just posted, so the slot is still there
            return match st.ring.unpost_last() {
                Some(buffer) => Err(buffer),
                None => Ok(()),
            };
        }
        Ok(())
    }

    /// Reconcile up to `budget` received packets and refill
    ///
    /// Completed buffers are consumed in ring order and grouped into packets.
    /// Packets no longer than `small_copy_len` are copied and their buffer
    /// recycled; larger ones are unmapped and handed to `stack` as they are.
    ///
    /// A completion whose request id does not match the next ring position
    /// drops that packet and recycles its buffers. A descriptor count of zero
    /// or above `max_rx_sgl` cannot be recovered from and sets
    /// [`RxCleanOutcome::reset`].
    ///
    /// # Arguments
    ///
    /// * `stack` - Receiver of the reassembled packets
    pub fn clean(&self, stack: &dyn NetStack) -> RxCleanOutcome {
        let mut outcome = RxCleanOutcome::default();
        let mut pending: Vec<(Vec<(RxBuffer, usize)>, u32)> = Vec::new();

        {
            let mut st = self.state.lock();
            let mut processed = 0;

            while processed < self.params.budget {
                let Some(completion) = st.hw.as_mut().and_then(|hw| hw.next_packet()) else {
                    break;
                };
                processed += 1;

                let count = completion.bufs.len();
                if count == 0 || count > self.params.max_rx_sgl {
                    inc(&self.stats.bad_desc_num);
                    tracing::error!(
                        "RX queue {} reported {} descriptors for one packet (max {})",
                        self.qid,
                        count,
                        self.params.max_rx_sgl
                    );
                    outcome.reset = Some(ResetReason::InvalidRxDescriptors { queue: self.qid });
                    break;
                }

                let mut taken = Vec::with_capacity(count);
                let mut bad_id = None;
                for info in &completion.bufs {
                    let expected = st.ring.next_to_clean();
                    if usize::from(info.req_id) != expected {
                        bad_id.get_or_insert(info.req_id);
                    }
                    match st.ring.reclaim(expected) {
                        Some(buffer) => {
                            let len = usize::from(info.len).min(buffer.data.len());
                            taken.push((buffer, len));
                        }
                        None => {
                            bad_id.get_or_insert(info.req_id);
                            break;
                        }
                    }
                }

                if let Some(req_id) = bad_id {
                    inc(&self.stats.bad_req_id);
                    tracing::warn!(
                        "{}",
                        EngineError::BadRequestId {
                            queue: self.qid,
                            req_id
                        }
                    );
                    st.recycled.extend(taken.into_iter().map(|(buffer, _)| buffer));
                    outcome.dropped += 1;
                    continue;
                }

                pending.push((taken, completion.hash));
            }

            outcome.reschedule = processed >= self.params.budget;
            if let Some(usecs) = st.moderation.observe(processed) {
                st.interval_usecs = usecs;
                if let Some(hw) = st.hw.as_mut() {
                    hw.set_interrupt_interval(usecs);
                }
            }
        }

        let mut recycle = Vec::new();
        let mut bytes = 0u64;
        for (buffers, hash) in pending {
            let packet = self.build_packet(buffers, hash, &mut recycle);
            bytes += packet.len() as u64;
            outcome.delivered += 1;
            tracing::trace!(
                "RX queue {} delivering {} bytes (hash {:#010x})",
                self.qid,
                packet.len(),
                hash
            );
            stack.deliver(packet);
        }
        if outcome.delivered > 0 {
            self.stats.record_rx(outcome.delivered as u64, bytes);
        }
        if !recycle.is_empty() {
            self.state.lock().recycled.extend(recycle);
        }

        let refill = self.refill(false);
        if outcome.reset.is_none() {
            outcome.reset = refill.reset;
        }
        outcome
    }

    fn build_packet(
        &self,
        mut buffers: Vec<(RxBuffer, usize)>,
        hash: u32,
        recycle: &mut Vec<RxBuffer>,
    ) -> RxPacket {
        if let [(_, len)] = buffers.as_slice() {
            let len = *len;
            if len <= self.params.small_copy_len {
                let Some((mut buffer, _)) = buffers.pop() else {
                    return RxPacket::new(self.qid, hash, Vec::new());
                };
                buffer.mapping.sync_for_cpu(&mut buffer.data[..len]);
                let copy = buffer.data[..len].to_vec();
                recycle.push(buffer);
                inc(&self.stats.small_copy_len_pkt);
                return RxPacket::new(self.qid, hash, vec![copy]);
            }
        }

        let fragments = buffers
            .into_iter()
            .map(|(buffer, len)| {
                let RxBuffer { mut data, mapping } = buffer;
                mapping.sync_for_cpu(&mut data[..len]);
                self.mapper.unmap(mapping);
                data.truncate(len);
                data
            })
            .collect();
        RxPacket::new(self.qid, hash, fragments)
    }

    /// Unmap every posted and recycled buffer and return it to the pool
    ///
    /// Only safe once the device can no longer write into the buffers.
    pub fn release_all(&self) -> usize {
        let buffers = {
            let mut st = self.state.lock();
            let mut buffers = st.ring.drain_all();
            buffers.append(&mut st.recycled);
            st.refill_failures = 0;
            buffers
        };
        let released = buffers.len();
        for RxBuffer { data, mapping } in buffers {
            self.mapper.unmap(mapping);
            self.pool.release(data);
        }
        if released > 0 {
            tracing::debug!("RX queue {} released {} buffers", self.qid, released);
        }
        released
    }

    /// Verify ring bookkeeping
    pub fn check_invariants(&self) -> Result<(), RingError> {
        self.state.lock().ring.check_invariants()
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> RxRingSnapshot {
        let st = self.state.lock();
        RxRingSnapshot {
            qid: self.qid,
            size: self.size,
            next_to_use: st.ring.next_to_use(),
            next_to_clean: st.ring.next_to_clean(),
            posted: st.ring.outstanding_count(),
            recycled: st.recycled.len(),
            interval_usecs: st.interval_usecs,
            stats: self.stats.snapshot(),
        }
    }
}

impl std::fmt::Debug for RxRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxRing")
            .field("qid", &self.qid)
            .field("size", &self.size)
            .field("params", &self.params)
            .finish()
    }
}
