//! Packets exchanged with the network stack

/// A packet handed to the engine for transmission
///
/// The payload may be split across several fragments (a scatter/gather
/// list); each fragment maps to one or more DMA segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPacket {
    fragments: Vec<Vec<u8>>,
    flow_hash: Option<u32>,
}

impl TxPacket {
    /// Single-fragment packet
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            fragments: vec![data],
            flow_hash: None,
        }
    }

    /// Packet made of several fragments, in wire order
    pub fn from_fragments(fragments: Vec<Vec<u8>>) -> Self {
        Self {
            fragments,
            flow_hash: None,
        }
    }

    /// Attach a flow hash used to pick the transmit queue
    pub fn with_flow_hash(mut self, hash: u32) -> Self {
        self.flow_hash = Some(hash);
        self
    }

    /// Flow hash, if one was attached
    pub fn flow_hash(&self) -> Option<u32> {
        self.flow_hash
    }

    /// Total payload length
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    /// True if the packet carries no payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fragments
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Fragments in wire order
    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.fragments
    }

    /// Merge all fragments into one contiguous buffer
    pub fn coalesce(&mut self) {
        if self.fragments.len() <= 1 {
            return;
        }
        let merged = self.fragments.concat();
        self.fragments = vec![merged];
    }

    /// Payload as one contiguous buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.fragments.concat()
    }
}

/// A received packet reassembled from one or more RX buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    queue_id: u16,
    hash: u32,
    fragments: Vec<Vec<u8>>,
}

impl RxPacket {
    pub(crate) fn new(queue_id: u16, hash: u32, fragments: Vec<Vec<u8>>) -> Self {
        Self {
            queue_id,
            hash,
            fragments,
        }
    }

    /// Queue pair the packet arrived on
    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// RSS hash reported by the device
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Total payload length
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    /// True if the packet carries no payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-buffer fragments, in ring order
    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.fragments
    }

    /// Take ownership of the fragments
    pub fn into_fragments(self) -> Vec<Vec<u8>> {
        self.fragments
    }

    /// Payload as one contiguous buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.fragments.concat()
    }
}

/// Consumer of received packets
pub trait NetStack: Send + Sync {
    /// Called exactly once per reassembled packet
    fn deliver(&self, packet: RxPacket);
}

impl NetStack for crossbeam_channel::Sender<RxPacket> {
    fn deliver(&self, packet: RxPacket) {
        if self.send(packet).is_err() {
            tracing::trace!("Network stack receiver gone, dropping packet");
        }
    }
}
