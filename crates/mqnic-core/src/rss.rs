//! Receive side scaling
//!
//! The device hashes each received flow with a Toeplitz hash and uses the low
//! bits to index a 128-entry indirection table that names the receive queue.
//! The engine keeps its own copy of the table so transmit traffic can be
//! steered the same way.

use std::net::{Ipv4Addr, SocketAddrV4};

/// Indirection table entries (log2 = 7)
pub const RSS_TABLE_SIZE: usize = 128;

/// Toeplitz key length in bytes
pub const RSS_KEY_LEN: usize = 40;

/// Standard Toeplitz verification key
pub const DEFAULT_RSS_KEY: [u8; RSS_KEY_LEN] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f,
    0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30,
    0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];

/// Toeplitz hash of `input` under `key`
///
/// The key must be at least four bytes longer than the input for every input
/// bit to see fresh key bits; missing key bytes read as zero.
pub fn toeplitz_hash(key: &[u8], input: &[u8]) -> u32 {
    let key_byte = |i: usize| key.get(i).copied().unwrap_or(0);
    let mut window = u32::from_be_bytes([key_byte(0), key_byte(1), key_byte(2), key_byte(3)]);
    let mut hash = 0u32;

    for (i, &byte) in input.iter().enumerate() {
        let next = key_byte(i + 4);
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                hash ^= window;
            }
            window <<= 1;
            if next & (0x80 >> bit) != 0 {
                window |= 1;
            }
        }
    }

    hash
}

/// Toeplitz hash of an IPv4 source/destination address pair
pub fn hash_ipv4(key: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u32 {
    let mut input = [0u8; 8];
    input[..4].copy_from_slice(&src.octets());
    input[4..].copy_from_slice(&dst.octets());
    toeplitz_hash(key, &input)
}

/// Toeplitz hash of an IPv4 TCP/UDP 4-tuple
pub fn hash_ipv4_tuple(key: &[u8], src: SocketAddrV4, dst: SocketAddrV4) -> u32 {
    let mut input = [0u8; 12];
    input[..4].copy_from_slice(&src.ip().octets());
    input[4..8].copy_from_slice(&dst.ip().octets());
    input[8..10].copy_from_slice(&src.port().to_be_bytes());
    input[10..].copy_from_slice(&dst.port().to_be_bytes());
    toeplitz_hash(key, &input)
}

/// RSS indirection table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssTable {
    entries: [u16; RSS_TABLE_SIZE],
    num_queues: u16,
    key: [u8; RSS_KEY_LEN],
}

impl RssTable {
    /// Table spreading flows over `num_queues` queues
    pub fn new(num_queues: u16) -> Self {
        let mut table = Self {
            entries: [0; RSS_TABLE_SIZE],
            num_queues: 1,
            key: DEFAULT_RSS_KEY,
        };
        table.rebuild(num_queues);
        table
    }

    /// Use a different hash key
    pub fn with_key(mut self, key: [u8; RSS_KEY_LEN]) -> Self {
        self.key = key;
        self
    }

    /// Reassign buckets round-robin over `num_queues` queues
    ///
    /// Bucket `i` maps to queue `i % num_queues`, so per-queue bucket counts
    /// differ by at most one. A queue count of 0 is treated as 1.
    pub fn rebuild(&mut self, num_queues: u16) {
        let n = num_queues.max(1);
        for (i, entry) in self.entries.iter_mut().enumerate() {
            *entry = (i % usize::from(n)) as u16;
        }
        self.num_queues = n;
    }

    /// Queue for a flow hash
    #[inline]
    pub fn queue_for_hash(&self, hash: u32) -> u16 {
        self.entries[hash as usize & (RSS_TABLE_SIZE - 1)]
    }

    /// Queue for an IPv4 4-tuple
    pub fn queue_for_flow(&self, src: SocketAddrV4, dst: SocketAddrV4) -> u16 {
        self.queue_for_hash(hash_ipv4_tuple(&self.key, src, dst))
    }

    /// Table as uploaded to the device
    pub fn as_slice(&self) -> &[u16] {
        &self.entries
    }

    /// Number of queues the table spreads over
    pub fn num_queues(&self) -> u16 {
        self.num_queues
    }

    /// Hash key
    pub fn key(&self) -> &[u8; RSS_KEY_LEN] {
        &self.key
    }

    /// Buckets assigned to each queue
    pub fn bucket_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; usize::from(self.num_queues)];
        for &q in &self.entries {
            counts[usize::from(q)] += 1;
        }
        counts
    }
}

impl Default for RssTable {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toeplitz_verification_vectors() {
        let src = SocketAddrV4::new(Ipv4Addr::new(66, 9, 149, 187), 2794);
        let dst = SocketAddrV4::new(Ipv4Addr::new(161, 142, 100, 80), 1766);

        assert_eq!(hash_ipv4(&DEFAULT_RSS_KEY, *src.ip(), *dst.ip()), 0x323e_8fc2);
        assert_eq!(hash_ipv4_tuple(&DEFAULT_RSS_KEY, src, dst), 0x51cc_c178);
    }

    #[test]
    fn test_toeplitz_second_vector() {
        let src = SocketAddrV4::new(Ipv4Addr::new(199, 92, 111, 2), 14230);
        let dst = SocketAddrV4::new(Ipv4Addr::new(65, 69, 140, 83), 4739);

        assert_eq!(hash_ipv4(&DEFAULT_RSS_KEY, *src.ip(), *dst.ip()), 0xd718_262a);
        assert_eq!(hash_ipv4_tuple(&DEFAULT_RSS_KEY, src, dst), 0xc626_b0ea);
    }

    #[test]
    fn test_empty_input_hashes_to_zero() {
        assert_eq!(toeplitz_hash(&DEFAULT_RSS_KEY, &[]), 0);
    }

    #[test]
    fn test_table_balanced_four_queues() {
        let table = RssTable::new(4);
        assert!(table.as_slice().iter().all(|&q| q < 4));
        assert_eq!(table.bucket_counts(), vec![32, 32, 32, 32]);
    }

    #[test]
    fn test_table_balanced_uneven() {
        let table = RssTable::new(3);
        let counts = table.bucket_counts();
        let min = *counts.iter().min().unwrap();
        let max = *counts.iter().max().unwrap();
        assert!(max - min <= 1);
        assert_eq!(counts.iter().sum::<usize>(), RSS_TABLE_SIZE);
    }

    #[test]
    fn test_queue_for_hash_uses_low_bits() {
        let table = RssTable::new(4);
        assert_eq!(table.queue_for_hash(5), 1);
        assert_eq!(table.queue_for_hash(5 + 128 * 1000), 1);
        assert_eq!(table.queue_for_hash(u32::MAX), 3);
    }

    #[test]
    fn test_rebuild_changes_spread() {
        let mut table = RssTable::new(8);
        table.rebuild(2);
        assert_eq!(table.num_queues(), 2);
        assert_eq!(table.bucket_counts(), vec![64, 64]);

        table.rebuild(0);
        assert!(table.as_slice().iter().all(|&q| q == 0));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_table_balanced(n in 1u16..=128, hash in any::<u32>()) {
                let table = RssTable::new(n);
                let counts = table.bucket_counts();
                let min = counts.iter().min().copied().unwrap_or(0);
                let max = counts.iter().max().copied().unwrap_or(0);
                prop_assert!(max - min <= 1);
                prop_assert!(table.queue_for_hash(hash) < n);
            }
        }
    }
}
