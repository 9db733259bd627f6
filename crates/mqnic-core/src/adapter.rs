//! Adapter: queue pair topology, lifecycle and reset handling
//!
//! The adapter owns every queue pair, the RSS indirection table and the
//! device-facing admin channel. Topology changes (activation, deactivation,
//! reset, queue count and MTU changes) are serialized by the topology lock;
//! the transmit fast path and interrupt dispatch only take a read lock on the
//! queue array.
//!
//! ```text
//!            activate                      deactivate
//!   Down ─────────────────────► Up ─────────────────────────► Down
//!     ▲                          │  stop accepting, stop workers,
//!     │                          │  drop backlog, drain TX (bounded),
//!     │                          │  destroy queues, release buffers
//!     │          reset           │
//!     └──── reset_device ◄───────┘
//! ```

use crate::buffer_pool::BufferPool;
use crate::config::AdapterConfig;
use crate::device::{AdminChannel, DeviceCapabilities, Direction, HwQueue, HwStats, QueueSpec};
use crate::dma::{DmaBus, DmaMapper, DmaMapperSnapshot};
use crate::error::{AdminError, EngineError, ResetReason, Result, SubmitError};
use crate::packet::{NetStack, TxPacket};
use crate::queue::{PollOutcome, QueueEvent, QueuePair, QueueWorker};
use crate::rss::RssTable;
use crate::rx::{RxParams, RxRing};
use crate::stats::{AdapterStats, DevStats, RingSnapshot, inc};
use crate::tx::TxRing;
use crate::watchdog::{HealthReport, ResetRequest, TimerService};
use crate::{io_irq_idx, io_rxq_idx, io_txq_idx};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Multi-queue network adapter
///
/// Created down; [`activate`](Self::activate) negotiates capabilities and
/// brings up the queue pairs. Dropping an active adapter deactivates it.
pub struct Adapter {
    shared: Arc<Shared>,
    timer: Mutex<Option<TimerService>>,
}

struct QueueSlot {
    pair: Arc<QueuePair>,
    worker: Option<QueueWorker>,
}

#[derive(Default)]
struct Topology {
    caps: Option<DeviceCapabilities>,
    mapper: Option<Arc<DmaMapper>>,
}

struct Shared {
    admin: Arc<dyn AdminChannel>,
    bus: Arc<dyn DmaBus>,
    stack: Arc<dyn NetStack>,
    config: Mutex<AdapterConfig>,
    topology: Mutex<Topology>,
    queues: RwLock<Vec<QueueSlot>>,
    rss: RwLock<RssTable>,
    up: AtomicBool,
    next_queue: AtomicUsize,
    resets: Arc<ResetRequest>,
    stats: DevStats,
    hw_stats: Mutex<HwStats>,
}

impl Adapter {
    /// Create an inactive adapter
    ///
    /// Starts the timer service when the watchdog is enabled.
    pub fn new(
        config: AdapterConfig,
        admin: Arc<dyn AdminChannel>,
        bus: Arc<dyn DmaBus>,
        stack: Arc<dyn NetStack>,
    ) -> Result<Self> {
        config.validate()?;
        let watchdog = config.watchdog;

        let shared = Arc::new(Shared {
            admin,
            bus,
            stack,
            config: Mutex::new(config),
            topology: Mutex::new(Topology::default()),
            queues: RwLock::new(Vec::new()),
            rss: RwLock::new(RssTable::default()),
            up: AtomicBool::new(false),
            next_queue: AtomicUsize::new(0),
            resets: Arc::new(ResetRequest::new()),
            stats: DevStats::new(),
            hw_stats: Mutex::new(HwStats::default()),
        });

        let timer = if watchdog.enabled {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            Some(TimerService::spawn(watchdog.interval(), move || {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                shared.timer_tick();
                true
            })?)
        } else {
            None
        };

        Ok(Self {
            shared,
            timer: Mutex::new(timer),
        })
    }

    /// Bring the adapter up
    ///
    /// Queries the device capabilities and validates the configuration
    /// against them, programs the MTU, then creates every queue pair: a TX
    /// and an RX hardware queue each, with the RX ring filled right away. The
    /// RSS table is programmed once every pair is up. With
    /// `dedicated_workers` set, one worker thread is spawned per pair.
    ///
    /// Any failure tears down the pairs created so far and leaves the
    /// adapter down.
    ///
    /// # Errors
    ///
    /// * [`EngineError::AlreadyActive`] if the adapter is already up
    /// * [`EngineError::InvalidConfig`] if the configuration exceeds the device
    ///   capabilities
    /// * [`EngineError::Admin`] if an admin command fails
    /// * [`EngineError::Ring`] if a queue pair cannot be built
    pub fn activate(&self) -> Result<()> {
        let mut topo = self.shared.topology.lock();
        self.shared.activate_locked(&mut topo)
    }

    /// Take the adapter down
    ///
    /// Stops accepting submissions, stops the workers and drops the TX
    /// backlogs. Outstanding transmissions then get up to
    /// `watchdog.shutdown_timeout_ms` to complete, after which every queue is
    /// destroyed and every buffer unmapped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotActive`] if the adapter is already down.
    /// Returns [`EngineError::DrainTimeout`] if outstanding transmissions did
    /// not complete within `watchdog.shutdown_timeout_ms`; the device has been
    /// reset and every buffer released in that case too.
    pub fn deactivate(&self) -> Result<()> {
        let mut topo = self.shared.topology.lock();
        self.shared.deactivate_locked(&mut topo)
    }

    /// Deactivate, reset the device and activate again
    pub fn reset(&self, reason: ResetReason) -> Result<()> {
        self.shared.reset(reason)
    }

    /// Record a reset request for the timer service
    pub fn request_reset(&self, reason: ResetReason) -> bool {
        self.shared.resets.request(reason)
    }

    /// Pending reset request, if any
    pub fn pending_reset(&self) -> Option<ResetReason> {
        self.shared.resets.peek()
    }

    /// Execute a pending reset request
    pub fn handle_reset_request(&self) -> Result<Option<ResetReason>> {
        self.shared.handle_reset_request()
    }

    /// Run the watchdog checks once
    pub fn check_health(&self) -> HealthReport {
        self.shared.check_health()
    }

    /// Change the number of queue pairs; `0` means one per CPU
    pub fn set_queue_count(&self, num_queues: u16) -> Result<()> {
        self.shared
            .reconfigure(|config| config.num_queues = num_queues)
    }

    /// Change the MTU
    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        self.shared.reconfigure(|config| config.mtu = mtu)
    }

    /// Submit a packet, steering by flow hash or round robin
    pub fn submit(&self, packet: TxPacket) -> std::result::Result<(), SubmitError> {
        self.shared.submit(packet)
    }

    /// Submit a packet to queue pair `qid`
    ///
    /// An unknown queue is reported as [`SubmitError::QueueDown`].
    pub fn submit_to(&self, qid: u16, packet: TxPacket) -> std::result::Result<(), SubmitError> {
        self.shared.submit_to(qid, packet)
    }

    /// Interrupt for queue pair `qid`
    ///
    /// With dedicated workers this posts an event and returns `None`;
    /// otherwise the pair is polled inline.
    pub fn on_interrupt(&self, qid: u16) -> Result<Option<PollOutcome>> {
        self.shared.on_interrupt(qid)
    }

    /// RSS queue for a flow hash
    pub fn queue_for_hash(&self, hash: u32) -> u16 {
        self.shared.rss.read().queue_for_hash(hash)
    }

    /// Copy of the RSS indirection table
    pub fn rss_table(&self) -> RssTable {
        self.shared.rss.read().clone()
    }

    /// Whether the adapter is up
    pub fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Acquire)
    }

    /// Active queue pairs
    pub fn num_queues(&self) -> u16 {
        u16::try_from(self.shared.queues.read().len()).unwrap_or(u16::MAX)
    }

    /// Queue pair `qid`
    pub fn queue(&self, qid: u16) -> Option<Arc<QueuePair>> {
        self.shared
            .queues
            .read()
            .get(usize::from(qid))
            .map(|slot| Arc::clone(&slot.pair))
    }

    /// Capabilities negotiated at the last activation
    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.shared.topology.lock().caps
    }

    /// Current configuration
    pub fn config(&self) -> AdapterConfig {
        self.shared.config.lock().clone()
    }

    /// DMA mapper accounting, while up
    pub fn dma_snapshot(&self) -> Option<DmaMapperSnapshot> {
        self.shared
            .topology
            .lock()
            .mapper
            .as_ref()
            .map(|mapper| mapper.snapshot())
    }

    /// Refresh hardware counters from the device
    pub fn update_hw_stats(&self) -> Result<HwStats> {
        self.shared.update_hw_stats()
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> AdapterStats {
        self.shared.stats()
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
        if self.is_up() {
            if let Err(e) = self.deactivate() {
                tracing::error!("Deactivation on drop failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("up", &self.is_up())
            .field("num_queues", &self.num_queues())
            .field("pending_reset", &self.pending_reset())
            .finish()
    }
}

impl Shared {
    fn activate_locked(&self, topo: &mut Topology) -> Result<()> {
        if self.up.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyActive);
        }

        let config = self.config.lock().clone();
        let caps = self.admin.get_capabilities()?;
        config.validate_against(&caps)?;
        self.admin.set_mtu(config.mtu)?;

        let num_queues = config.effective_queue_count(&caps);
        let mapper = Arc::new(DmaMapper::new(
            Arc::clone(&self.bus),
            config.tx_segment_budget(&caps),
            config.max_segment_size,
        ));

        let mut slots = Vec::with_capacity(usize::from(num_queues));
        for qid in 0..num_queues {
            match self.build_pair(qid, &config, &caps, &mapper) {
                Ok(pair) => slots.push(QueueSlot {
                    pair: Arc::new(pair),
                    worker: None,
                }),
                Err(e) => {
                    tracing::error!("Failed to bring up queue {}: {}", qid, e);
                    self.teardown_slots(slots);
                    return Err(e);
                }
            }
        }

        {
            let mut rss = self.rss.write();
            rss.rebuild(num_queues);
            if let Err(e) = self.admin.set_rss_indirection(rss.as_slice()) {
                drop(rss);
                self.teardown_slots(slots);
                return Err(e.into());
            }
        }

        if config.dedicated_workers {
            for i in 0..slots.len() {
                let spawned = QueueWorker::spawn(
                    Arc::clone(&slots[i].pair),
                    Arc::clone(&self.stack),
                    Arc::clone(&self.resets),
                    config.event_queue_depth,
                );
                match spawned {
                    Ok(worker) => slots[i].worker = Some(worker),
                    Err(e) => {
                        self.teardown_slots(slots);
                        return Err(e);
                    }
                }
            }
        }

        *self.queues.write() = slots;
        topo.caps = Some(caps);
        topo.mapper = Some(mapper);
        self.up.store(true, Ordering::Release);
        inc(&self.stats.interface_up);
        tracing::info!(
            "Adapter up: {} queue pairs, MTU {}, {} workers",
            num_queues,
            config.mtu,
            if config.dedicated_workers { "dedicated" } else { "no" }
        );
        Ok(())
    }

    fn build_pair(
        &self,
        qid: u16,
        config: &AdapterConfig,
        caps: &DeviceCapabilities,
        mapper: &Arc<DmaMapper>,
    ) -> Result<QueuePair> {
        let cpu = usize::from(qid) % num_cpus::get().max(1);
        let vector = io_irq_idx(qid);

        let tx = TxRing::new(
            qid,
            config.tx_ring_size as usize,
            config.tx_backlog,
            config.doorbell_threshold,
            Arc::clone(mapper),
            &config.moderation,
        )?;
        let params = RxParams {
            budget: config.rx_budget,
            small_copy_len: config.rx_small_copy_len,
            refill_divider: config.refill_divider as usize,
            max_rx_sgl: usize::from(caps.max_rx_sgl),
            refill_failure_policy: config.refill_failure_policy,
        };
        let rx = RxRing::new(
            qid,
            config.rx_ring_size as usize,
            BufferPool::new(config.rx_buf_size(), config.rx_pool_size),
            Arc::clone(mapper),
            params,
            &config.moderation,
        )?;

        let tx_spec = QueueSpec {
            direction: Direction::Tx,
            hw_index: io_txq_idx(qid),
            depth: config.tx_ring_size,
            cpu,
            vector,
        };
        let tx_hw = match self.admin.create_queue(&tx_spec)? {
            HwQueue::Tx(hw) => hw,
            other => {
                self.destroy(other);
                return Err(AdminError::Failed(format!("queue {qid}: device returned an RX queue for TX")).into());
            }
        };

        let rx_spec = QueueSpec {
            direction: Direction::Rx,
            hw_index: io_rxq_idx(qid),
            depth: config.rx_ring_size,
            ..tx_spec
        };
        let rx_hw = match self.admin.create_queue(&rx_spec) {
            Ok(HwQueue::Rx(hw)) => hw,
            Ok(other) => {
                self.destroy(other);
                self.destroy(HwQueue::Tx(tx_hw));
                return Err(AdminError::Failed(format!("queue {qid}: device returned a TX queue for RX")).into());
            }
            Err(e) => {
                self.destroy(HwQueue::Tx(tx_hw));
                return Err(e.into());
            }
        };

        tx.attach(tx_hw);
        rx.attach(rx_hw);
        let refill = rx.refill(true);
        if refill.posted + 1 < rx.size() {
            tracing::warn!(
                "Queue {} activated with {} of {} RX buffers",
                qid,
                refill.posted,
                rx.size() - 1
            );
        }
        if let Some(reason) = refill.reset {
            self.resets.request(reason);
        }

        tracing::debug!("Queue pair {} up (cpu {}, vector {})", qid, cpu, vector);
        Ok(QueuePair::new(tx, rx, cpu, vector))
    }

    fn destroy(&self, queue: HwQueue) {
        let index = queue.hw_index();
        if let Err(e) = self.admin.destroy_queue(queue) {
            tracing::warn!("Failed to destroy hardware queue {}: {}", index, e);
        }
    }

    /// Destroy the hardware queues of a pair, then release its buffers
    fn teardown_pair(&self, pair: &QueuePair) {
        pair.tx().set_accepting(false);
        if let Some(hw) = pair.tx().detach() {
            self.destroy(HwQueue::Tx(hw));
        }
        if let Some(hw) = pair.rx().detach() {
            self.destroy(HwQueue::Rx(hw));
        }
        pair.tx().drop_backlog();
        pair.tx().release_all();
        pair.rx().release_all();
    }

    fn teardown_slots(&self, slots: Vec<QueueSlot>) {
        for slot in slots {
            if let Some(worker) = slot.worker {
                worker.stop();
            }
            self.teardown_pair(&slot.pair);
        }
    }

    fn deactivate_locked(&self, topo: &mut Topology) -> Result<()> {
        if !self.up.swap(false, Ordering::AcqRel) {
            return Err(EngineError::NotActive);
        }

        let mut slots = std::mem::take(&mut *self.queues.write());
        for slot in &slots {
            slot.pair.tx().set_accepting(false);
        }
        for slot in &mut slots {
            if let Some(worker) = slot.worker.take() {
                worker.stop();
            }
        }
        for slot in &slots {
            slot.pair.tx().drop_backlog();
        }

        let timeout = self.config.lock().watchdog.shutdown_timeout();
        let stuck = self.drain_tx(&slots, timeout);
        if let Some((queue, outstanding)) = stuck {
            tracing::error!("{}", EngineError::DrainTimeout { queue, outstanding });
            match self.admin.reset_device() {
                Ok(()) => inc(&self.stats.resets),
                Err(e) => tracing::error!("Device reset failed: {}", e),
            }
        }

        self.teardown_slots(slots);
        topo.mapper = None;
        inc(&self.stats.interface_down);
        tracing::info!("Adapter down");

        match stuck {
            Some((queue, outstanding)) => Err(EngineError::DrainTimeout { queue, outstanding }),
            None => Ok(()),
        }
    }

    /// Reconcile TX completions until every ring is empty or `timeout`
    /// expires; returns the first ring still holding descriptors
    fn drain_tx(&self, slots: &[QueueSlot], timeout: Duration) -> Option<(u16, usize)> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut stuck = None;
            for slot in slots {
                let tx = slot.pair.tx();
                tx.clean();
                let outstanding = tx.outstanding();
                if outstanding > 0 && stuck.is_none() {
                    stuck = Some((tx.qid(), outstanding));
                }
            }
            match stuck {
                None => return None,
                Some(stuck) if Instant::now() >= deadline => return Some(stuck),
                Some(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn reset(&self, reason: ResetReason) -> Result<()> {
        let mut topo = self.topology.lock();
        if !self.up.load(Ordering::Acquire) {
            return Err(EngineError::NotActive);
        }
        tracing::error!("Resetting adapter: {}", reason);

        match self.deactivate_locked(&mut topo) {
            Ok(()) => {
                self.admin.reset_device()?;
                inc(&self.stats.resets);
            }
            // Device already reset
            Err(EngineError::DrainTimeout { .. }) => {}
            Err(e) => return Err(e),
        }

        self.activate_locked(&mut topo)?;
        tracing::info!("Adapter reset complete");
        Ok(())
    }

    fn handle_reset_request(&self) -> Result<Option<ResetReason>> {
        let Some(reason) = self.resets.take() else {
            return Ok(None);
        };
        if !self.up.load(Ordering::Acquire) {
            tracing::debug!("Discarding reset request while down: {}", reason);
            return Ok(None);
        }
        self.reset(reason)?;
        Ok(Some(reason))
    }

    fn reconfigure(&self, apply: impl FnOnce(&mut AdapterConfig)) -> Result<()> {
        let mut topo = self.topology.lock();
        let mut config = self.config.lock().clone();
        apply(&mut config);
        config.validate()?;
        if let Some(caps) = topo.caps.as_ref() {
            config.validate_against(caps)?;
        }
        *self.config.lock() = config;

        if self.up.load(Ordering::Acquire) {
            if let Err(e) = self.deactivate_locked(&mut topo) {
                tracing::warn!("Deactivation during reconfiguration: {}", e);
            }
            self.activate_locked(&mut topo)?;
        }
        Ok(())
    }

    fn submit(&self, packet: TxPacket) -> std::result::Result<(), SubmitError> {
        let queues = self.queues.read();
        if queues.is_empty() {
            return Err(SubmitError::QueueDown(packet));
        }
        let index = match packet.flow_hash() {
            Some(hash) => usize::from(self.rss.read().queue_for_hash(hash)),
            None => self.next_queue.fetch_add(1, Ordering::Relaxed),
        } % queues.len();
        Self::submit_slot(&queues[index], packet)
    }

    fn submit_to(&self, qid: u16, packet: TxPacket) -> std::result::Result<(), SubmitError> {
        let queues = self.queues.read();
        match queues.get(usize::from(qid)) {
            Some(slot) => Self::submit_slot(slot, packet),
            None => Err(SubmitError::QueueDown(packet)),
        }
    }

    fn submit_slot(slot: &QueueSlot, packet: TxPacket) -> std::result::Result<(), SubmitError> {
        let tx = slot.pair.tx();
        tx.enqueue(packet)?;
        if tx.try_drain().is_none() {
            if let Some(worker) = &slot.worker {
                worker.notify(QueueEvent::Enqueue);
            }
        }
        Ok(())
    }

    fn on_interrupt(&self, qid: u16) -> Result<Option<PollOutcome>> {
        let pair = {
            let queues = self.queues.read();
            if queues.is_empty() {
                return Err(EngineError::NotActive);
            }
            let slot = queues
                .get(usize::from(qid))
                .ok_or(EngineError::UnknownQueue(qid))?;
            if let Some(worker) = &slot.worker {
                worker.notify(QueueEvent::Interrupt);
                return Ok(None);
            }
            Arc::clone(&slot.pair)
        };

        let outcome = pair.poll(&*self.stack);
        if let Some(reason) = outcome.reset {
            self.resets.request(reason);
        }
        Ok(Some(outcome))
    }

    fn check_health(&self) -> HealthReport {
        let mut report = HealthReport::default();
        if !self.up.load(Ordering::Acquire) {
            return report;
        }
        let watchdog = self.config.lock().watchdog;

        let mut reason = None;
        for slot in self.queues.read().iter() {
            let pair = &slot.pair;
            let missing = pair
                .tx()
                .check_missing_completions(watchdog.missing_tx_timeout());
            report.missing_tx += missing.total_missing;
            report.newly_missing_tx += missing.newly_missing;
            if missing.total_missing > watchdog.missing_tx_threshold {
                tracing::warn!(
                    "Queue {}: {} TX completions missing (threshold {})",
                    pair.id(),
                    missing.total_missing,
                    watchdog.missing_tx_threshold
                );
                reason.get_or_insert(ResetReason::MissingTxCompletions { queue: pair.id() });
            }

            let tx_check = pair.tx().check_invariants();
            let rx_check = pair.rx().check_invariants();
            if let Err(e) = tx_check.and(rx_check) {
                tracing::error!("Queue {} ring check failed: {}", pair.id(), e);
                report.corrupted_rings += 1;
                reason.get_or_insert(ResetReason::RingCorruption { queue: pair.id() });
            }
        }

        if let Some(reason) = reason {
            inc(&self.stats.wd_expired);
            self.resets.request(reason);
            report.reset = Some(reason);
        }
        report
    }

    fn update_hw_stats(&self) -> Result<HwStats> {
        let hw = self.admin.get_hw_stats()?;
        *self.hw_stats.lock() = hw;
        Ok(hw)
    }

    fn stats(&self) -> AdapterStats {
        let rings = self
            .queues
            .read()
            .iter()
            .flat_map(|slot| {
                [
                    RingSnapshot::Tx(slot.pair.tx().snapshot()),
                    RingSnapshot::Rx(slot.pair.rx().snapshot()),
                ]
            })
            .collect();
        AdapterStats {
            dev: self.stats.snapshot(),
            hw: *self.hw_stats.lock(),
            rings,
        }
    }

    fn timer_tick(&self) {
        if !self.up.load(Ordering::Acquire) {
            return;
        }
        let report = self.check_health();
        if !report.is_healthy() {
            tracing::debug!("Health check: {:?}", report);
        }
        if let Err(e) = self.update_hw_stats() {
            tracing::debug!("Hardware statistics unavailable: {}", e);
        }
        if let Err(e) = self.handle_reset_request() {
            tracing::error!("Reset failed: {}", e);
        }
    }
}
