//! Simulated DMA bus
//!
//! Every mapping gets a bus address and a shadow copy of the host buffer.
//! The device model reads TX data from and writes RX data into the shadow;
//! `sync_for_cpu` copies it back to the host buffer. A mapping budget models
//! IOMMU exhaustion.

use mqnic_core::{DmaBus, DmaDirection, DmaError};
use parking_lot::Mutex;
use std::collections::BTreeMap;

const BUS_BASE: u64 = 0x1_0000_0000;
const BUS_ALIGN: u64 = 64;

struct Region {
    data: Vec<u8>,
    direction: DmaDirection,
}

#[derive(Default)]
struct BusState {
    regions: BTreeMap<u64, Region>,
    next_addr: u64,
    max_mappings: Option<usize>,
    fail_next: usize,
    total_maps: u64,
    total_unmaps: u64,
    bad_unmaps: u64,
}

/// Bus address space with shadow buffers
#[derive(Default)]
pub struct SimBus {
    state: Mutex<BusState>,
}

impl SimBus {
    /// Unlimited bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus that fails once `max` regions are mapped
    pub fn with_max_mappings(max: usize) -> Self {
        let bus = Self::default();
        bus.state.lock().max_mappings = Some(max);
        bus
    }

    /// Change the mapping budget
    pub fn set_max_mappings(&self, max: Option<usize>) {
        self.state.lock().max_mappings = max;
    }

    /// Fail the next `count` map calls
    pub fn fail_next_maps(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Regions currently mapped
    pub fn active_mappings(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Successful map calls so far
    pub fn total_maps(&self) -> u64 {
        self.state.lock().total_maps
    }

    /// Unmap calls so far
    pub fn total_unmaps(&self) -> u64 {
        self.state.lock().total_unmaps
    }

    /// Unmaps of addresses that were not mapped
    pub fn bad_unmaps(&self) -> u64 {
        self.state.lock().bad_unmaps
    }

    /// Whether `addr` starts a mapped region
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.state.lock().regions.contains_key(&addr)
    }

    /// Read `len` bytes of the region at `addr`
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let region = state.regions.get(&addr)?;
        region.data.get(..len).map(<[u8]>::to_vec)
    }

    /// Device write into the region at `addr`
    ///
    /// Fails if the region is unmapped, too short, or mapped to-device.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.regions.get_mut(&addr) {
            Some(region)
                if region.direction == DmaDirection::FromDevice && data.len() <= region.data.len() =>
            {
                region.data[..data.len()].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }
}

impl DmaBus for SimBus {
    fn map(&self, buf: &[u8], direction: DmaDirection) -> Result<u64, DmaError> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DmaError::Mapping("injected mapping failure".into()));
        }
        if let Some(max) = state.max_mappings {
            if state.regions.len() >= max {
                return Err(DmaError::Mapping(format!(
                    "IOMMU exhausted ({max} regions mapped)"
                )));
            }
        }

        let addr = BUS_BASE + state.next_addr;
        state.next_addr += (buf.len() as u64).max(1).next_multiple_of(BUS_ALIGN);
        state.regions.insert(
            addr,
            Region {
                data: buf.to_vec(),
                direction,
            },
        );
        state.total_maps += 1;
        tracing::trace!("Mapped {} bytes at {:#x} ({:?})", buf.len(), addr, direction);
        Ok(addr)
    }

    fn sync_for_cpu(&self, bus_addr: u64, buf: &mut [u8]) {
        let state = self.state.lock();
        match state.regions.get(&bus_addr) {
            Some(region) => {
                let n = buf.len().min(region.data.len());
                buf[..n].copy_from_slice(&region.data[..n]);
            }
            None => tracing::error!("sync_for_cpu on unmapped address {:#x}", bus_addr),
        }
    }

    fn unmap(&self, bus_addr: u64, len: usize, direction: DmaDirection) {
        let mut state = self.state.lock();
        state.total_unmaps += 1;
        match state.regions.remove(&bus_addr) {
            Some(region) if region.direction == direction && region.data.len() == len => {}
            Some(region) => {
                state.bad_unmaps += 1;
                tracing::error!(
                    "Unmap of {:#x} with {} bytes {:?}, mapped as {} bytes {:?}",
                    bus_addr,
                    len,
                    direction,
                    region.data.len(),
                    region.direction
                );
            }
            None => {
                state.bad_unmaps += 1;
                tracing::error!("Unmap of unmapped address {:#x}", bus_addr);
            }
        }
    }
}

impl std::fmt::Debug for SimBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimBus")
            .field("active", &state.regions.len())
            .field("max_mappings", &state.max_mappings)
            .field("total_maps", &state.total_maps)
            .field("total_unmaps", &state.total_unmaps)
            .finish()
    }
}
