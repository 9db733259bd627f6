//! In-crate fakes for unit tests

use crate::device::{
    AdminChannel, DeviceCapabilities, Direction, HwQueue, HwStats, QueueSpec, RxBufInfo,
    RxCompletion, RxHwQueue, TxHwQueue,
};
use crate::dma::{DmaBus, DmaDirection, DmaSegment};
use crate::error::{AdminError, DmaError, HwError};
use crate::packet::{NetStack, RxPacket};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct BusInner {
    regions: HashMap<u64, Vec<u8>>,
    next_addr: u64,
    limit: Option<usize>,
    fail_next: usize,
    unmaps: usize,
}

/// Bus that keeps a shadow copy of every mapped region
#[derive(Default)]
pub(crate) struct FakeBus {
    inner: Mutex<BusInner>,
}

impl FakeBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_limit(limit: usize) -> Self {
        let bus = Self::default();
        bus.inner.lock().limit = Some(limit);
        bus
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    pub(crate) fn active(&self) -> usize {
        self.inner.lock().regions.len()
    }

    pub(crate) fn unmaps(&self) -> usize {
        self.inner.lock().unmaps
    }

    pub(crate) fn is_mapped(&self, addr: u64) -> bool {
        self.inner.lock().regions.contains_key(&addr)
    }

    pub(crate) fn read(&self, addr: u64) -> Vec<u8> {
        self.inner.lock().regions[&addr].clone()
    }

    pub(crate) fn write(&self, addr: u64, data: &[u8]) {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&addr).expect("write to unmapped address");
        region[..data.len()].copy_from_slice(data);
    }
}

impl DmaBus for FakeBus {
    fn map(&self, buf: &[u8], _direction: DmaDirection) -> Result<u64, DmaError> {
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(DmaError::Mapping("injected failure".into()));
        }
        if inner.limit.is_some_and(|l| inner.regions.len() >= l) {
            return Err(DmaError::Mapping("IOMMU exhausted".into()));
        }
        let addr = inner.next_addr + 0x1000;
        inner.next_addr += (buf.len() as u64).max(1).next_multiple_of(64);
        inner.regions.insert(addr, buf.to_vec());
        Ok(addr)
    }

    fn sync_for_cpu(&self, bus_addr: u64, buf: &mut [u8]) {
        let inner = self.inner.lock();
        let region = &inner.regions[&bus_addr];
        let n = buf.len().min(region.len());
        buf[..n].copy_from_slice(&region[..n]);
    }

    fn unmap(&self, bus_addr: u64, _len: usize, _direction: DmaDirection) {
        let mut inner = self.inner.lock();
        assert!(
            inner.regions.remove(&bus_addr).is_some(),
            "unmap of unmapped address {bus_addr:#x}"
        );
        inner.unmaps += 1;
    }
}

#[derive(Default)]
pub(crate) struct TxQueueState {
    pub(crate) posted: Vec<(u16, Vec<DmaSegment>)>,
    pub(crate) completions: VecDeque<u16>,
    pub(crate) doorbells: usize,
    pub(crate) interval: Option<u32>,
    pub(crate) reject_next: Option<HwError>,
}

/// TX queue whose completions are driven by the test
#[derive(Clone, Default)]
pub(crate) struct FakeTxQueue {
    pub(crate) state: Arc<Mutex<TxQueueState>>,
    hw_index: u16,
}

impl FakeTxQueue {
    pub(crate) fn new(hw_index: u16) -> Self {
        Self {
            state: Arc::default(),
            hw_index,
        }
    }

    /// Report `ids` complete, in order
    pub(crate) fn complete(&self, ids: &[u16]) {
        let mut st = self.state.lock();
        for &id in ids {
            if let Some(i) = st.posted.iter().position(|(p, _)| *p == id) {
                st.posted.remove(i);
            }
            st.completions.push_back(id);
        }
    }

    pub(crate) fn complete_all(&self) {
        let mut st = self.state.lock();
        let ids: Vec<u16> = st.posted.drain(..).map(|(id, _)| id).collect();
        st.completions.extend(ids);
    }

    pub(crate) fn posted_ids(&self) -> Vec<u16> {
        self.state.lock().posted.iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn doorbells(&self) -> usize {
        self.state.lock().doorbells
    }

    pub(crate) fn interval(&self) -> Option<u32> {
        self.state.lock().interval
    }
}

impl TxHwQueue for FakeTxQueue {
    fn hw_index(&self) -> u16 {
        self.hw_index
    }

    fn write_descriptors(&mut self, req_id: u16, segments: &[DmaSegment]) -> Result<(), HwError> {
        let mut st = self.state.lock();
        if let Some(err) = st.reject_next.take() {
            return Err(err);
        }
        st.posted.push((req_id, segments.to_vec()));
        Ok(())
    }

    fn ring_doorbell(&mut self) {
        self.state.lock().doorbells += 1;
    }

    fn next_completion(&mut self) -> Option<u16> {
        self.state.lock().completions.pop_front()
    }

    fn set_interrupt_interval(&mut self, usecs: u32) {
        self.state.lock().interval = Some(usecs);
    }
}

#[derive(Default)]
pub(crate) struct RxQueueState {
    pub(crate) posted: VecDeque<(u16, DmaSegment)>,
    pub(crate) completions: VecDeque<RxCompletion>,
    pub(crate) doorbells: usize,
    pub(crate) interval: Option<u32>,
}

/// RX queue that receives frames written by the test
#[derive(Clone, Default)]
pub(crate) struct FakeRxQueue {
    pub(crate) state: Arc<Mutex<RxQueueState>>,
    hw_index: u16,
}

impl FakeRxQueue {
    pub(crate) fn new(hw_index: u16) -> Self {
        Self {
            state: Arc::default(),
            hw_index,
        }
    }

    pub(crate) fn posted(&self) -> usize {
        self.state.lock().posted.len()
    }

    /// Write `frame` into the next posted buffers and report it
    pub(crate) fn receive(&self, bus: &FakeBus, frame: &[u8], hash: u32) -> bool {
        let mut st = self.state.lock();
        let mut bufs = Vec::new();
        let mut rest = frame;
        while !rest.is_empty() {
            let Some((req_id, seg)) = st.posted.pop_front() else {
                return false;
            };
            let n = rest.len().min(seg.len as usize);
            bus.write(seg.bus_addr, &rest[..n]);
            bufs.push(RxBufInfo {
                req_id,
                len: n as u16,
            });
            rest = &rest[n..];
        }
        st.completions.push_back(RxCompletion { bufs, hash });
        true
    }

    pub(crate) fn inject(&self, completion: RxCompletion) {
        self.state.lock().completions.push_back(completion);
    }
}

impl RxHwQueue for FakeRxQueue {
    fn hw_index(&self) -> u16 {
        self.hw_index
    }

    fn write_descriptor(&mut self, req_id: u16, segment: DmaSegment) -> Result<(), HwError> {
        self.state.lock().posted.push_back((req_id, segment));
        Ok(())
    }

    fn ring_doorbell(&mut self) {
        self.state.lock().doorbells += 1;
    }

    fn next_packet(&mut self) -> Option<RxCompletion> {
        self.state.lock().completions.pop_front()
    }

    fn set_interrupt_interval(&mut self, usecs: u32) {
        self.state.lock().interval = Some(usecs);
    }
}

#[derive(Default)]
pub(crate) struct AdminState {
    pub(crate) tx: HashMap<u16, FakeTxQueue>,
    pub(crate) rx: HashMap<u16, FakeRxQueue>,
    pub(crate) specs: Vec<QueueSpec>,
    pub(crate) rss: Vec<u16>,
    pub(crate) mtu: Option<u32>,
    pub(crate) resets: usize,
    pub(crate) destroyed: usize,
}

/// Admin channel handing out fake queues, keyed by queue pair id
pub(crate) struct FakeAdmin {
    pub(crate) caps: DeviceCapabilities,
    pub(crate) state: Mutex<AdminState>,
}

impl FakeAdmin {
    pub(crate) fn new(caps: DeviceCapabilities) -> Self {
        Self {
            caps,
            state: Mutex::default(),
        }
    }

    pub(crate) fn tx(&self, qid: u16) -> FakeTxQueue {
        self.state.lock().tx[&qid].clone()
    }

    pub(crate) fn rx(&self, qid: u16) -> FakeRxQueue {
        self.state.lock().rx[&qid].clone()
    }
}

impl AdminChannel for FakeAdmin {
    fn get_capabilities(&self) -> Result<DeviceCapabilities, AdminError> {
        Ok(self.caps)
    }

    fn create_queue(&self, spec: &QueueSpec) -> Result<HwQueue, AdminError> {
        let mut st = self.state.lock();
        st.specs.push(*spec);
        let qid = spec.hw_index / 2;
        Ok(match spec.direction {
            Direction::Tx => {
                let q = FakeTxQueue::new(spec.hw_index);
                st.tx.insert(qid, q.clone());
                HwQueue::Tx(Box::new(q))
            }
            Direction::Rx => {
                let q = FakeRxQueue::new(spec.hw_index);
                st.rx.insert(qid, q.clone());
                HwQueue::Rx(Box::new(q))
            }
        })
    }

    fn destroy_queue(&self, _queue: HwQueue) -> Result<(), AdminError> {
        self.state.lock().destroyed += 1;
        Ok(())
    }

    fn set_rss_indirection(&self, table: &[u16]) -> Result<(), AdminError> {
        self.state.lock().rss = table.to_vec();
        Ok(())
    }

    fn set_mtu(&self, mtu: u32) -> Result<(), AdminError> {
        self.state.lock().mtu = Some(mtu);
        Ok(())
    }

    fn reset_device(&self) -> Result<(), AdminError> {
        self.state.lock().resets += 1;
        Ok(())
    }

    fn get_hw_stats(&self) -> Result<HwStats, AdminError> {
        Ok(HwStats::default())
    }
}

/// Network stack that records every delivered packet
#[derive(Default)]
pub(crate) struct CollectStack {
    packets: Mutex<Vec<RxPacket>>,
}

impl CollectStack {
    pub(crate) fn take(&self) -> Vec<RxPacket> {
        std::mem::take(&mut *self.packets.lock())
    }
}

impl NetStack for CollectStack {
    fn deliver(&self, packet: RxPacket) {
        self.packets.lock().push(packet);
    }
}
