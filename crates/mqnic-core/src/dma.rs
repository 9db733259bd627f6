//! DMA buffer mapping
//!
//! Host buffers are made visible to the device by mapping them through a
//! [`DmaBus`] (an IOMMU or a direct physical mapping). A buffer larger than
//! `max_segment_size` becomes a scatter/gather list of several segments; the
//! device accepts at most `max_segments` segments per packet.
//!
//! A [`DmaMapping`] owns its bus resources: dropping it unmaps every segment,
//! so a buffer can never be unmapped twice and never leaks a mapping.

use crate::error::DmaError;
use crate::packet::TxPacket;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Direction of a DMA transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// Device reads host memory (transmit)
    ToDevice,
    /// Device writes host memory (receive)
    FromDevice,
}

/// One contiguous bus-addressable region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Address as seen by the device
    pub bus_addr: u64,
    /// Length in bytes
    pub len: u32,
}

/// Bus address mapping service
///
/// Implemented by the platform (IOMMU, bounce buffers, identity mapping) or
/// by a device model in tests.
pub trait DmaBus: Send + Sync {
    /// Map `buf` for a transfer in `direction`, returning its bus address
    fn map(&self, buf: &[u8], direction: DmaDirection) -> Result<u64, DmaError>;

    /// Make device writes to `bus_addr` visible in `buf`
    fn sync_for_cpu(&self, bus_addr: u64, buf: &mut [u8]);

    /// Release a mapping created by [`DmaBus::map`]
    fn unmap(&self, bus_addr: u64, len: usize, direction: DmaDirection);
}

/// Mapper-wide counters
#[derive(Debug, Default)]
struct MapAccounting {
    active_segments: AtomicUsize,
    mapped_bytes: AtomicU64,
    map_failures: AtomicU64,
    coalesced: AtomicU64,
}

/// Snapshot of mapper accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaMapperSnapshot {
    /// Segments currently mapped
    pub active_segments: usize,
    /// Bytes currently mapped
    pub mapped_bytes: u64,
    /// Failed map attempts
    pub map_failures: u64,
    /// TX packets coalesced to fit the segment budget
    pub coalesced: u64,
}

/// A mapped buffer; unmapped when dropped
pub struct DmaMapping {
    segments: Vec<DmaSegment>,
    direction: DmaDirection,
    len: usize,
    bus: Arc<dyn DmaBus>,
    accounting: Arc<MapAccounting>,
}

impl DmaMapping {
    /// Scatter/gather list in buffer order
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    /// Transfer direction
    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Total mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy device-written data into `buf`, segment by segment
    ///
    /// Copies at most `buf.len()` bytes.
    pub fn sync_for_cpu(&self, buf: &mut [u8]) {
        let mut offset = 0;
        for seg in &self.segments {
            if offset >= buf.len() {
                break;
            }
            let end = (offset + seg.len as usize).min(buf.len());
            self.bus.sync_for_cpu(seg.bus_addr, &mut buf[offset..end]);
            offset = end;
        }
    }

    fn push(&mut self, segment: DmaSegment) {
        self.accounting
            .active_segments
            .fetch_add(1, Ordering::Relaxed);
        self.accounting
            .mapped_bytes
            .fetch_add(u64::from(segment.len), Ordering::Relaxed);
        self.len += segment.len as usize;
        self.segments.push(segment);
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        for seg in self.segments.drain(..) {
            self.bus
                .unmap(seg.bus_addr, seg.len as usize, self.direction);
            self.accounting
                .active_segments
                .fetch_sub(1, Ordering::Relaxed);
            self.accounting
                .mapped_bytes
                .fetch_sub(u64::from(seg.len), Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for DmaMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaMapping")
            .field("segments", &self.segments)
            .field("direction", &self.direction)
            .field("len", &self.len)
            .finish()
    }
}

/// Maps host buffers into bounded scatter/gather lists
pub struct DmaMapper {
    bus: Arc<dyn DmaBus>,
    max_segments: usize,
    max_segment_size: usize,
    accounting: Arc<MapAccounting>,
}

impl DmaMapper {
    /// Create a mapper over `bus`
    ///
    /// `max_segments` is the per-packet ceiling, `max_segment_size` the
    /// largest single segment the device accepts. Both are clamped to 1.
    pub fn new(bus: Arc<dyn DmaBus>, max_segments: usize, max_segment_size: usize) -> Self {
        Self {
            bus,
            max_segments: max_segments.max(1),
            max_segment_size: max_segment_size.max(1),
            accounting: Arc::new(MapAccounting::default()),
        }
    }

    /// Per-packet segment ceiling
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Largest single segment
    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    /// Segments needed to map `len` bytes
    pub fn segments_for(&self, len: usize) -> usize {
        len.div_ceil(self.max_segment_size)
    }

    /// Map one contiguous buffer
    pub fn map(&self, buf: &[u8], direction: DmaDirection) -> Result<DmaMapping, DmaError> {
        self.map_fragments(&[buf], direction)
    }

    /// Map a scatter/gather list of fragments as one mapping
    ///
    /// Empty fragments are skipped. On any bus failure the segments mapped so
    /// far are released before the error is returned.
    pub fn map_fragments<B: AsRef<[u8]>>(
        &self,
        fragments: &[B],
        direction: DmaDirection,
    ) -> Result<DmaMapping, DmaError> {
        let segments: usize = fragments
            .iter()
            .map(|f| self.segments_for(f.as_ref().len()))
            .sum();
        if segments == 0 {
            self.accounting.map_failures.fetch_add(1, Ordering::Relaxed);
            return Err(DmaError::Mapping("zero-length buffer".into()));
        }
        if segments > self.max_segments {
            return Err(DmaError::TooManyFragments {
                segments,
                max: self.max_segments,
            });
        }

        let mut mapping = DmaMapping {
            segments: Vec::with_capacity(segments),
            direction,
            len: 0,
            bus: Arc::clone(&self.bus),
            accounting: Arc::clone(&self.accounting),
        };

        for chunk in fragments
            .iter()
            .flat_map(|f| f.as_ref().chunks(self.max_segment_size))
        {
            match self.bus.map(chunk, direction) {
                Ok(bus_addr) => mapping.push(DmaSegment {
                    bus_addr,
                    len: chunk.len() as u32,
                }),
                Err(e) => {
                    self.accounting.map_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "DMA map failed after {} of {} segments: {}",
                        mapping.segments.len(),
                        segments,
                        e
                    );
                    // Dropping the partial mapping unmaps what was mapped
                    return Err(e);
                }
            }
        }

        Ok(mapping)
    }

    /// Release a mapping
    pub fn unmap(&self, mapping: DmaMapping) {
        drop(mapping);
    }

    /// Map a transmit packet within the per-packet segment budget
    ///
    /// A packet whose fragments need more segments than allowed is coalesced
    /// into one contiguous buffer first. Packets that still do not fit are
    /// rejected with [`DmaError::TooManyFragments`].
    pub fn map_tx_packet(&self, packet: &mut TxPacket) -> Result<DmaMapping, DmaError> {
        let natural: usize = packet
            .fragments()
            .iter()
            .map(|f| self.segments_for(f.len()))
            .sum();

        if natural > self.max_segments {
            let linear = self.segments_for(packet.len());
            if linear > self.max_segments {
                return Err(DmaError::TooManyFragments {
                    segments: natural,
                    max: self.max_segments,
                });
            }
            tracing::trace!(
                "Coalescing {} fragments ({} segments) into {} segments",
                packet.fragment_count(),
                natural,
                linear
            );
            packet.coalesce();
            self.accounting.coalesced.fetch_add(1, Ordering::Relaxed);
        }

        self.map_fragments(packet.fragments(), DmaDirection::ToDevice)
    }

    /// Snapshot of the mapper's accounting
    pub fn snapshot(&self) -> DmaMapperSnapshot {
        DmaMapperSnapshot {
            active_segments: self.accounting.active_segments.load(Ordering::Relaxed),
            mapped_bytes: self.accounting.mapped_bytes.load(Ordering::Relaxed),
            map_failures: self.accounting.map_failures.load(Ordering::Relaxed),
            coalesced: self.accounting.coalesced.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DmaMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaMapper")
            .field("max_segments", &self.max_segments)
            .field("max_segment_size", &self.max_segment_size)
            .field("accounting", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBus;

    fn mapper(bus: &Arc<FakeBus>, max_segments: usize, max_segment_size: usize) -> DmaMapper {
        DmaMapper::new(bus.clone(), max_segments, max_segment_size)
    }

    #[test]
    fn test_map_splits_by_segment_size() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 4, 1000);

        let mapping = m.map(&[7u8; 2500], DmaDirection::ToDevice).unwrap();
        let lens: Vec<u32> = mapping.segments().iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![1000, 1000, 500]);
        assert_eq!(mapping.len(), 2500);
        assert_eq!(bus.active(), 3);

        let snap = m.snapshot();
        assert_eq!(snap.active_segments, 3);
        assert_eq!(snap.mapped_bytes, 2500);

        m.unmap(mapping);
        assert_eq!(bus.active(), 0);
        assert_eq!(m.snapshot(), DmaMapperSnapshot::default());
    }

    #[test]
    fn test_map_rejects_too_many_segments() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 2, 100);
        let err = m.map(&[0u8; 301], DmaDirection::ToDevice).unwrap_err();
        assert_eq!(err, DmaError::TooManyFragments { segments: 4, max: 2 });
        assert_eq!(bus.active(), 0);
    }

    #[test]
    fn test_partial_mapping_rolled_back() {
        let bus = Arc::new(FakeBus::with_limit(2));
        let m = mapper(&bus, 8, 100);

        let err = m.map(&[0u8; 350], DmaDirection::ToDevice).unwrap_err();
        assert!(matches!(err, DmaError::Mapping(_)));
        assert_eq!(bus.active(), 0);
        assert_eq!(m.snapshot().active_segments, 0);
        assert_eq!(m.snapshot().map_failures, 1);
    }

    #[test]
    fn test_zero_length_rejected() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 4, 100);
        assert!(m.map(&[], DmaDirection::ToDevice).is_err());
        let empty: [&[u8]; 2] = [&[], &[]];
        assert!(m.map_fragments(&empty, DmaDirection::ToDevice).is_err());
    }

    #[test]
    fn test_map_fragments_preserves_order() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 4, 100);
        let frags: [&[u8]; 3] = [&[1; 10], &[], &[2; 150]];

        let mapping = m.map_fragments(&frags, DmaDirection::ToDevice).unwrap();
        assert_eq!(mapping.segments().len(), 3);
        assert_eq!(bus.read(mapping.segments()[0].bus_addr), vec![1; 10]);
        assert_eq!(bus.read(mapping.segments()[1].bus_addr), vec![2; 100]);
        assert_eq!(bus.read(mapping.segments()[2].bus_addr), vec![2; 50]);
    }

    #[test]
    fn test_sync_for_cpu_reads_device_writes() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 4, 4);
        let mut buf = vec![0u8; 8];
        let mapping = m.map(&buf, DmaDirection::FromDevice).unwrap();

        bus.write(mapping.segments()[0].bus_addr, &[1, 2, 3, 4]);
        bus.write(mapping.segments()[1].bus_addr, &[5, 6]);
        mapping.sync_for_cpu(&mut buf[..6]);
        assert_eq!(&buf[..6], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_tx_packet_coalesced_when_over_budget() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 3, 1000);
        let mut packet = TxPacket::from_fragments((0..5u8).map(|i| vec![i; 10]).collect());

        let mapping = m.map_tx_packet(&mut packet).unwrap();
        assert_eq!(packet.fragment_count(), 1);
        assert_eq!(mapping.segments().len(), 1);
        assert_eq!(mapping.len(), 50);
        assert_eq!(m.snapshot().coalesced, 1);
    }

    #[test]
    fn test_tx_packet_rejected_when_coalescing_cannot_help() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 2, 100);
        let mut packet = TxPacket::from_fragments(vec![vec![0; 100]; 3]);

        let err = m.map_tx_packet(&mut packet).unwrap_err();
        assert_eq!(err, DmaError::TooManyFragments { segments: 3, max: 2 });
        assert_eq!(packet.fragment_count(), 3);
    }

    #[test]
    fn test_dropped_mapping_unmaps() {
        let bus = Arc::new(FakeBus::new());
        let m = mapper(&bus, 4, 64);
        {
            let _mapping = m.map(&[0u8; 100], DmaDirection::ToDevice).unwrap();
            assert_eq!(bus.active(), 2);
        }
        assert_eq!(bus.active(), 0);
        assert_eq!(bus.unmaps(), 2);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_round_trip_restores_counters(
                lens in prop::collection::vec(1usize..5000, 1..20),
                seg in 64usize..2048,
            ) {
                let bus = Arc::new(FakeBus::new());
                let m = DmaMapper::new(bus.clone(), 19, seg);
                let before = m.snapshot();

                let mut live = Vec::new();
                for len in lens {
                    if let Ok(mapping) = m.map(&vec![0u8; len], DmaDirection::ToDevice) {
                        prop_assert_eq!(mapping.len(), len);
                        prop_assert!(mapping.segments().iter().all(|s| s.len as usize <= seg));
                        live.push(mapping);
                    }
                }
                for mapping in live {
                    m.unmap(mapping);
                }

                let after = m.snapshot();
                prop_assert_eq!(after.active_segments, before.active_segments);
                prop_assert_eq!(after.mapped_bytes, before.mapped_bytes);
                prop_assert_eq!(bus.active(), 0);
            }
        }
    }
}
