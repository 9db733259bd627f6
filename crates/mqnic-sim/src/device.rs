//! Simulated multi-queue device
//!
//! [`SimDevice`] implements the admin channel and hands out TX/RX queue
//! handles backed by shared per-queue models. Tests drive the device side
//! through the same handle: completing transmissions, receiving frames,
//! injecting bogus completions and collecting pending interrupts.
//!
//! TX descriptors become visible to the device when the doorbell rings; at
//! that point their data is read through the [`SimBus`]. In auto-complete
//! mode they complete immediately; in loopback mode the frames are received
//! again, steered by the RSS table.

use crate::bus::SimBus;
use mqnic_core::rss::DEFAULT_RSS_KEY;
use mqnic_core::{
    AdminChannel, AdminError, DeviceCapabilities, Direction, DmaSegment, HwError, HwQueue,
    HwStats, QueueSpec, RxBufInfo, RxCompletion, RxHwQueue, TxHwQueue, toeplitz_hash,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Bytes of a looped-back frame fed to the RSS hash
const LOOPBACK_HASH_LEN: usize = 12;

struct TxDesc {
    req_id: u16,
    segments: Vec<DmaSegment>,
    fetched: bool,
}

struct TxModel {
    generation: u64,
    depth: usize,
    interval: Option<u32>,
    posted: Vec<TxDesc>,
    completions: VecDeque<u16>,
    doorbells: usize,
    transmitted: Vec<Vec<u8>>,
    reject_next: Option<HwError>,
}

struct RxModel {
    generation: u64,
    depth: usize,
    interval: Option<u32>,
    posted: VecDeque<(u16, DmaSegment)>,
    completions: VecDeque<RxCompletion>,
    doorbells: usize,
}

#[derive(Default)]
struct DeviceState {
    tx: BTreeMap<u16, TxModel>,
    rx: BTreeMap<u16, RxModel>,
    specs: Vec<QueueSpec>,
    rss: Vec<u16>,
    mtu: Option<u32>,
    generation: u64,
    resets: usize,
    destroyed: usize,
    auto_complete: bool,
    loopback: bool,
    creates_before_failure: Option<usize>,
    hw_stats: HwStats,
    pending_irqs: BTreeSet<u16>,
}

struct Inner {
    caps: DeviceCapabilities,
    bus: Arc<SimBus>,
    state: Mutex<DeviceState>,
}

/// Software model of a multi-queue adapter
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<Inner>,
}

impl SimDevice {
    /// Device with `caps`, doing DMA through `bus`
    pub fn new(caps: DeviceCapabilities, bus: Arc<SimBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                caps,
                bus,
                state: Mutex::new(DeviceState::default()),
            }),
        }
    }

    /// Device with default capabilities and its own bus
    pub fn with_default_caps() -> Self {
        Self::new(DeviceCapabilities::default(), Arc::new(SimBus::new()))
    }

    /// The DMA bus
    pub fn bus(&self) -> Arc<SimBus> {
        Arc::clone(&self.inner.bus)
    }

    /// Advertised capabilities
    pub fn caps(&self) -> DeviceCapabilities {
        self.inner.caps
    }

    /// Complete TX descriptors as soon as the doorbell fetches them
    pub fn set_auto_complete(&self, on: bool) {
        self.inner.state.lock().auto_complete = on;
    }

    /// Receive every transmitted frame again
    pub fn set_loopback(&self, on: bool) {
        self.inner.state.lock().loopback = on;
    }

    /// Let `n` more queue creations succeed, then fail the rest
    pub fn fail_create_queue_after(&self, n: Option<usize>) {
        self.inner.state.lock().creates_before_failure = n;
    }

    /// Reject the next descriptor write on TX queue `qid`
    pub fn reject_next_tx(&self, qid: u16, err: HwError) {
        if let Some(model) = self.inner.state.lock().tx.get_mut(&qid) {
            model.reject_next = Some(err);
        }
    }

    /// Complete fetched TX descriptors with the given ids, in order
    ///
    /// Returns how many ids named an in-flight descriptor.
    pub fn complete_tx(&self, qid: u16, ids: &[u16]) -> usize {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let Some(model) = st.tx.get_mut(&qid) else {
            return 0;
        };
        let mut done = 0;
        for &id in ids {
            if let Some(i) = model.posted.iter().position(|d| d.fetched && d.req_id == id) {
                model.posted.remove(i);
                model.completions.push_back(id);
                done += 1;
            }
        }
        if done > 0 {
            st.pending_irqs.insert(qid);
        }
        done
    }

    /// Complete every fetched TX descriptor, in posting order
    pub fn complete_all_tx(&self, qid: u16) -> usize {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let Some(model) = st.tx.get_mut(&qid) else {
            return 0;
        };
        let done = complete_fetched(model);
        if done > 0 {
            st.pending_irqs.insert(qid);
        }
        done
    }

    /// Push a raw completion, valid or not
    pub fn inject_tx_completion(&self, qid: u16, req_id: u16) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        if let Some(model) = st.tx.get_mut(&qid) {
            model.completions.push_back(req_id);
            st.pending_irqs.insert(qid);
        }
    }

    /// Request ids written to TX queue `qid` and not yet completed
    pub fn tx_in_flight(&self, qid: u16) -> Vec<u16> {
        self.inner
            .state
            .lock()
            .tx
            .get(&qid)
            .map(|m| m.posted.iter().map(|d| d.req_id).collect())
            .unwrap_or_default()
    }

    /// Doorbells rung on TX queue `qid`
    pub fn tx_doorbells(&self, qid: u16) -> usize {
        self.inner.state.lock().tx.get(&qid).map_or(0, |m| m.doorbells)
    }

    /// Interrupt interval programmed on TX queue `qid`
    pub fn tx_interval(&self, qid: u16) -> Option<u32> {
        self.inner.state.lock().tx.get(&qid).and_then(|m| m.interval)
    }

    /// Frames fetched from TX queue `qid` since the last call
    pub fn take_transmitted(&self, qid: u16) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .tx
            .get_mut(&qid)
            .map(|m| std::mem::take(&mut m.transmitted))
            .unwrap_or_default()
    }

    /// Receive `frame` on RX queue `qid`
    ///
    /// Returns `false` (and counts a drop) if not enough buffers are posted.
    pub fn receive(&self, qid: u16, frame: &[u8], hash: u32) -> bool {
        let mut guard = self.inner.state.lock();
        receive_locked(&self.inner, &mut guard, qid, frame, hash)
    }

    /// Receive `frame` on the queue the RSS table assigns to `hash`
    pub fn receive_hashed(&self, frame: &[u8], hash: u32) -> Option<u16> {
        let mut guard = self.inner.state.lock();
        let qid = steer(&guard.rss, hash);
        receive_locked(&self.inner, &mut guard, qid, frame, hash).then_some(qid)
    }

    /// Push a raw RX completion, valid or not
    pub fn inject_rx_completion(&self, qid: u16, completion: RxCompletion) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        if let Some(model) = st.rx.get_mut(&qid) {
            model.completions.push_back(completion);
            st.pending_irqs.insert(qid);
        }
    }

    /// Empty buffers posted on RX queue `qid`
    pub fn rx_posted(&self, qid: u16) -> usize {
        self.inner.state.lock().rx.get(&qid).map_or(0, |m| m.posted.len())
    }

    /// Doorbells rung on RX queue `qid`
    pub fn rx_doorbells(&self, qid: u16) -> usize {
        self.inner.state.lock().rx.get(&qid).map_or(0, |m| m.doorbells)
    }

    /// Interrupt interval programmed on RX queue `qid`
    pub fn rx_interval(&self, qid: u16) -> Option<u32> {
        self.inner.state.lock().rx.get(&qid).and_then(|m| m.interval)
    }

    /// Queue pairs with completions since the last call
    pub fn take_pending_interrupts(&self) -> Vec<u16> {
        std::mem::take(&mut self.inner.state.lock().pending_irqs)
            .into_iter()
            .collect()
    }

    /// Device resets performed
    pub fn resets(&self) -> usize {
        self.inner.state.lock().resets
    }

    /// Queues destroyed
    pub fn destroyed(&self) -> usize {
        self.inner.state.lock().destroyed
    }

    /// Every queue creation request seen
    pub fn queue_specs(&self) -> Vec<QueueSpec> {
        self.inner.state.lock().specs.clone()
    }

    /// Queues currently existing
    pub fn live_queues(&self) -> usize {
        let st = self.inner.state.lock();
        st.tx.len() + st.rx.len()
    }

    /// Last uploaded RSS indirection table
    pub fn rss_table(&self) -> Vec<u16> {
        self.inner.state.lock().rss.clone()
    }

    /// Last programmed MTU
    pub fn mtu(&self) -> Option<u32> {
        self.inner.state.lock().mtu
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("SimDevice")
            .field("caps", &self.inner.caps)
            .field("tx_queues", &st.tx.len())
            .field("rx_queues", &st.rx.len())
            .field("resets", &st.resets)
            .finish()
    }
}

fn steer(rss: &[u16], hash: u32) -> u16 {
    if rss.is_empty() {
        0
    } else {
        rss[hash as usize % rss.len()]
    }
}

fn complete_fetched(model: &mut TxModel) -> usize {
    let mut done = 0;
    let mut i = 0;
    while i < model.posted.len() {
        if model.posted[i].fetched {
            let desc = model.posted.remove(i);
            model.completions.push_back(desc.req_id);
            done += 1;
        } else {
            i += 1;
        }
    }
    done
}

fn receive_locked(inner: &Inner, st: &mut DeviceState, qid: u16, frame: &[u8], hash: u32) -> bool {
    let max_bufs = usize::from(inner.caps.max_rx_sgl);
    let Some(model) = st.rx.get_mut(&qid) else {
        st.hw_stats.rx_drops += 1;
        return false;
    };

    let mut needed = 0;
    let mut capacity = 0usize;
    for (_, seg) in &model.posted {
        if capacity >= frame.len() && needed > 0 {
            break;
        }
        capacity += seg.len as usize;
        needed += 1;
    }
    if frame.is_empty() || capacity < frame.len() || needed > max_bufs {
        st.hw_stats.rx_drops += 1;
        tracing::trace!("Sim RX queue {} dropped {} byte frame", qid, frame.len());
        return false;
    }

    let mut bufs = Vec::with_capacity(needed);
    let mut rest = frame;
    for _ in 0..needed {
        let Some((req_id, seg)) = model.posted.pop_front() else {
            break;
        };
        let n = rest.len().min(seg.len as usize);
        if !inner.bus.write(seg.bus_addr, &rest[..n]) {
            tracing::error!("Sim RX queue {} wrote to unmapped buffer {:#x}", qid, seg.bus_addr);
        }
        bufs.push(RxBufInfo {
            req_id,
            len: n as u16,
        });
        rest = &rest[n..];
    }

    model.completions.push_back(RxCompletion { bufs, hash });
    st.hw_stats.rx_packets += 1;
    st.hw_stats.rx_bytes += frame.len() as u64;
    st.pending_irqs.insert(qid);
    true
}

/// Transmit queue handle
struct SimTxQueue {
    inner: Arc<Inner>,
    qid: u16,
    hw_index: u16,
    generation: u64,
}

impl SimTxQueue {
    fn with_model<R>(&self, f: impl FnOnce(&mut TxModel) -> R) -> Option<R> {
        let mut st = self.inner.state.lock();
        st.tx
            .get_mut(&self.qid)
            .filter(|m| m.generation == self.generation)
            .map(f)
    }
}

impl TxHwQueue for SimTxQueue {
    fn hw_index(&self) -> u16 {
        self.hw_index
    }

    fn write_descriptors(&mut self, req_id: u16, segments: &[DmaSegment]) -> Result<(), HwError> {
        let max_sgl = usize::from(self.inner.caps.max_tx_sgl);
        self.with_model(|model| {
            if let Some(err) = model.reject_next.take() {
                return Err(err);
            }
            if segments.is_empty() || segments.len() > max_sgl {
                return Err(HwError::Failed(format!(
                    "{} segments outside 1..={max_sgl}",
                    segments.len()
                )));
            }
            if model.posted.len() >= model.depth {
                return Err(HwError::NoSpace);
            }
            if model.posted.iter().any(|d| d.req_id == req_id) {
                return Err(HwError::Failed(format!("request id {req_id} already in flight")));
            }
            model.posted.push(TxDesc {
                req_id,
                segments: segments.to_vec(),
                fetched: false,
            });
            Ok(())
        })
        .unwrap_or_else(|| Err(HwError::Failed("queue destroyed".into())))
    }

    fn ring_doorbell(&mut self) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let Some(model) = st
            .tx
            .get_mut(&self.qid)
            .filter(|m| m.generation == self.generation)
        else {
            return;
        };
        model.doorbells += 1;

        let mut frames = Vec::new();
        for desc in model.posted.iter_mut().filter(|d| !d.fetched) {
            desc.fetched = true;
            let mut frame = Vec::new();
            for seg in &desc.segments {
                match self.inner.bus.read(seg.bus_addr, seg.len as usize) {
                    Some(bytes) => frame.extend_from_slice(&bytes),
                    None => tracing::error!(
                        "Sim TX queue {} descriptor {} points at unmapped {:#x}",
                        self.qid,
                        desc.req_id,
                        seg.bus_addr
                    ),
                }
            }
            frames.push(frame);
        }
        if frames.is_empty() {
            return;
        }

        if st.auto_complete && complete_fetched(model) > 0 {
            st.pending_irqs.insert(self.qid);
        }
        st.hw_stats.tx_packets += frames.len() as u64;
        st.hw_stats.tx_bytes += frames.iter().map(|f| f.len() as u64).sum::<u64>();
        model.transmitted.extend(frames.iter().cloned());

        if st.loopback {
            for frame in &frames {
                let hash = toeplitz_hash(&DEFAULT_RSS_KEY, &frame[..frame.len().min(LOOPBACK_HASH_LEN)]);
                let target = steer(&st.rss, hash);
                receive_locked(&self.inner, st, target, frame, hash);
            }
        }
    }

    fn next_completion(&mut self) -> Option<u16> {
        self.with_model(|model| model.completions.pop_front()).flatten()
    }

    fn set_interrupt_interval(&mut self, usecs: u32) {
        self.with_model(|model| model.interval = Some(usecs));
    }
}

/// Receive queue handle
struct SimRxQueue {
    inner: Arc<Inner>,
    qid: u16,
    hw_index: u16,
    generation: u64,
}

impl SimRxQueue {
    fn with_model<R>(&self, f: impl FnOnce(&mut RxModel) -> R) -> Option<R> {
        let mut st = self.inner.state.lock();
        st.rx
            .get_mut(&self.qid)
            .filter(|m| m.generation == self.generation)
            .map(f)
    }
}

impl RxHwQueue for SimRxQueue {
    fn hw_index(&self) -> u16 {
        self.hw_index
    }

    fn write_descriptor(&mut self, req_id: u16, segment: DmaSegment) -> Result<(), HwError> {
        self.with_model(|model| {
            if model.posted.len() >= model.depth {
                return Err(HwError::NoSpace);
            }
            model.posted.push_back((req_id, segment));
            Ok(())
        })
        .unwrap_or_else(|| Err(HwError::Failed("queue destroyed".into())))
    }

    fn ring_doorbell(&mut self) {
        self.with_model(|model| model.doorbells += 1);
    }

    fn next_packet(&mut self) -> Option<RxCompletion> {
        self.with_model(|model| model.completions.pop_front()).flatten()
    }

    fn set_interrupt_interval(&mut self, usecs: u32) {
        self.with_model(|model| model.interval = Some(usecs));
    }
}

impl AdminChannel for SimDevice {
    fn get_capabilities(&self) -> Result<DeviceCapabilities, AdminError> {
        Ok(self.inner.caps)
    }

    fn create_queue(&self, spec: &QueueSpec) -> Result<HwQueue, AdminError> {
        let caps = self.inner.caps;
        let mut st = self.inner.state.lock();

        if let Some(left) = st.creates_before_failure.as_mut() {
            if *left == 0 {
                return Err(AdminError::Failed("queue creation failed".into()));
            }
            *left -= 1;
        }

        let qid = spec.hw_index / 2;
        let expected = if spec.hw_index % 2 == 0 {
            Direction::Tx
        } else {
            Direction::Rx
        };
        if spec.direction != expected {
            return Err(AdminError::Failed(format!(
                "hw index {} is not a {:?} queue",
                spec.hw_index, spec.direction
            )));
        }
        if qid >= caps.max_queues {
            return Err(AdminError::Failed(format!("queue {qid} beyond device maximum")));
        }
        if spec.depth == 0 || spec.depth > caps.max_ring_size {
            return Err(AdminError::Failed(format!("unsupported depth {}", spec.depth)));
        }

        st.generation += 1;
        let generation = st.generation;
        st.specs.push(*spec);
        let depth = spec.depth as usize;
        tracing::debug!("Sim device created {:?} queue {} (depth {})", spec.direction, spec.hw_index, depth);

        Ok(match spec.direction {
            Direction::Tx => {
                st.tx.insert(
                    qid,
                    TxModel {
                        generation,
                        depth,
                        interval: None,
                        posted: Vec::new(),
                        completions: VecDeque::new(),
                        doorbells: 0,
                        transmitted: Vec::new(),
                        reject_next: None,
                    },
                );
                HwQueue::Tx(Box::new(SimTxQueue {
                    inner: Arc::clone(&self.inner),
                    qid,
                    hw_index: spec.hw_index,
                    generation,
                }))
            }
            Direction::Rx => {
                st.rx.insert(
                    qid,
                    RxModel {
                        generation,
                        depth,
                        interval: None,
                        posted: VecDeque::new(),
                        completions: VecDeque::new(),
                        doorbells: 0,
                    },
                );
                HwQueue::Rx(Box::new(SimRxQueue {
                    inner: Arc::clone(&self.inner),
                    qid,
                    hw_index: spec.hw_index,
                    generation,
                }))
            }
        })
    }

    fn destroy_queue(&self, queue: HwQueue) -> Result<(), AdminError> {
        let qid = queue.hw_index() / 2;
        let mut st = self.inner.state.lock();
        let removed = match queue.direction() {
            Direction::Tx => st.tx.remove(&qid).is_some(),
            Direction::Rx => st.rx.remove(&qid).is_some(),
        };
        if !removed {
            return Err(AdminError::Failed(format!("no queue at hw index {}", queue.hw_index())));
        }
        st.destroyed += 1;
        Ok(())
    }

    fn set_rss_indirection(&self, table: &[u16]) -> Result<(), AdminError> {
        if table.is_empty() {
            return Err(AdminError::Failed("empty indirection table".into()));
        }
        if let Some(&bad) = table.iter().find(|&&q| q >= self.inner.caps.max_queues) {
            return Err(AdminError::Failed(format!("indirection entry {bad} out of range")));
        }
        self.inner.state.lock().rss = table.to_vec();
        Ok(())
    }

    fn set_mtu(&self, mtu: u32) -> Result<(), AdminError> {
        if mtu > self.inner.caps.max_mtu {
            return Err(AdminError::Failed(format!("mtu {mtu} unsupported")));
        }
        self.inner.state.lock().mtu = Some(mtu);
        Ok(())
    }

    fn reset_device(&self) -> Result<(), AdminError> {
        let mut st = self.inner.state.lock();
        for model in st.tx.values_mut() {
            model.posted.clear();
            model.completions.clear();
        }
        for model in st.rx.values_mut() {
            model.posted.clear();
            model.completions.clear();
        }
        st.pending_irqs.clear();
        st.resets += 1;
        tracing::info!("Sim device reset ({} total)", st.resets);
        Ok(())
    }

    fn get_hw_stats(&self) -> Result<HwStats, AdminError> {
        Ok(self.inner.state.lock().hw_stats)
    }
}
