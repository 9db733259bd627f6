//! Descriptor ring and TX free-id pool
//!
//! A [`DescriptorRing`] tracks the host-side metadata (`buffer_info`) of every
//! buffer handed to the device. It is a fixed power-of-two array indexed with
//! wrap-around arithmetic:
//!
//! ```text
//!            next_to_clean              next_to_use
//!                  │                         │
//!  ┌────┬────┬────┬▼───┬────┬────┬────┬────┬▼───┬────┐
//!  │free│free│free│dev │done│dev │dev │dev │free│free│
//!  └────┴────┴────┴────┴────┴────┴────┴────┴────┴────┘
//!                  └──── device-owned window ───┘
//! ```
//!
//! Slots in `[next_to_clean, next_to_use)` belong to the device (or wait for
//! reclamation); everything else is host-owned. One slot is always left free
//! so that `next_to_use == next_to_clean` unambiguously means empty.
//!
//! Slots may be reclaimed out of order (`done` above); `next_to_clean` only
//! advances over the contiguous prefix of reclaimed slots.

use crate::error::RingError;

/// Largest supported ring; request ids are 16 bits wide.
pub const MAX_RING_SIZE: usize = 1 << 15;

/// Advance a ring index by `n` with wrap-around
#[inline]
pub const fn ring_idx_add(idx: usize, n: usize, ring_size: usize) -> usize {
    (idx + n) & (ring_size - 1)
}

/// Advance a ring index by one with wrap-around
#[inline]
pub const fn ring_idx_next(idx: usize, ring_size: usize) -> usize {
    ring_idx_add(idx, 1, ring_size)
}

/// Fixed-size circular array of buffer-tracking slots
#[derive(Debug)]
pub struct DescriptorRing<T> {
    /// `buffer_info`: one entry per slot, `Some` while owned by the device
    slots: Box<[Option<T>]>,
    /// Next free slot to post into (producer)
    next_to_use: usize,
    /// Next slot expected to be reclaimed (consumer)
    next_to_clean: usize,
}

impl<T> DescriptorRing<T> {
    /// Create an empty ring of `ring_size` slots
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidSize`] unless `ring_size` is a power of two
    /// in `2..=32768`.
    pub fn new(ring_size: usize) -> Result<Self, RingError> {
        if !ring_size.is_power_of_two() || !(2..=MAX_RING_SIZE).contains(&ring_size) {
            return Err(RingError::InvalidSize(ring_size));
        }

        let slots = std::iter::repeat_with(|| None).take(ring_size).collect();
        Ok(Self {
            slots,
            next_to_use: 0,
            next_to_clean: 0,
        })
    }

    /// Ring capacity
    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Position the next post will use
    #[inline]
    pub fn next_to_use(&self) -> usize {
        self.next_to_use
    }

    /// Position the next in-order reclaim expects
    #[inline]
    pub fn next_to_clean(&self) -> usize {
        self.next_to_clean
    }

    /// Slots in the device-owned window, including reclaimed-but-not-yet-passed ones
    #[inline]
    pub fn occupancy(&self) -> usize {
        self.next_to_use.wrapping_sub(self.next_to_clean) & (self.size() - 1)
    }

    /// Slots that can still be posted while keeping the one-slot gap
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.size() - 1 - self.occupancy()
    }

    /// True when no slot is device-owned
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_to_use == self.next_to_clean
    }

    /// Check that `n_slots` can be posted
    ///
    /// Succeeds only if at least `n_slots + 1` slots are free, so that the
    /// producer never catches up with the consumer. Slots reclaimed out of
    /// order still count as occupied until `next_to_clean` passes them.
    ///
    /// Nothing is held by a successful check: callers reserve and post under
    /// the same lock.
    ///
    /// # Arguments
    ///
    /// * `n_slots` - Number of descriptors the caller is about to post
    ///
    /// # Errors
    ///
    /// Returns [`RingError::RingFull`] if fewer than `n_slots + 1` slots are
    /// free.
    ///
    /// # Example
    ///
    /// ```
    /// use mqnic_core::DescriptorRing;
    ///
    /// let mut ring = DescriptorRing::<u32>::new(4).unwrap();
    /// assert!(ring.try_reserve(3).is_ok());
    /// assert!(ring.try_reserve(4).is_err());
    ///
    /// ring.post(7).unwrap();
    /// assert!(ring.try_reserve(3).is_err());
    /// ```
    pub fn try_reserve(&self, n_slots: usize) -> Result<(), RingError> {
        if self.size() - self.occupancy() > n_slots {
            Ok(())
        } else {
            Err(RingError::RingFull)
        }
    }

    /// Write `data` into the slot at `next_to_use` and advance it
    ///
    /// Returns the position written, or hands `data` back if the ring is full.
    pub fn post(&mut self, data: T) -> Result<usize, (RingError, T)> {
        if let Err(e) = self.try_reserve(1) {
            return Err((e, data));
        }

        let pos = self.next_to_use;
        debug_assert!(self.slots[pos].is_none(), "posting into an occupied slot");
        self.slots[pos] = Some(data);
        self.next_to_use = ring_idx_next(pos, self.size());
        Ok(pos)
    }

    /// Undo the most recent [`post`](Self::post)
    ///
    /// Used when the device rejects descriptors for a slot that was just
    /// written. Returns `None` if the ring is empty or that slot was already
    /// reclaimed.
    pub fn unpost_last(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let pos = self.next_to_use.wrapping_sub(1) & (self.size() - 1);
        let data = self.slots[pos].take()?;
        self.next_to_use = pos;
        Some(data)
    }

    /// True if `pos` lies in the device-owned window
    #[inline]
    pub fn in_window(&self, pos: usize) -> bool {
        pos < self.size() && pos.wrapping_sub(self.next_to_clean) & (self.size() - 1) < self.occupancy()
    }

    /// Release the slot at `pos` and return its metadata
    ///
    /// `next_to_clean` advances past every contiguous reclaimed slot. Returns
    /// `None` if `pos` is outside the window or was already reclaimed.
    pub fn reclaim(&mut self, pos: usize) -> Option<T> {
        if !self.in_window(pos) {
            return None;
        }

        let data = self.slots[pos].take()?;
        while self.next_to_clean != self.next_to_use && self.slots[self.next_to_clean].is_none() {
            self.next_to_clean = ring_idx_next(self.next_to_clean, self.size());
        }
        Some(data)
    }

    /// Metadata at `pos`, if it is still outstanding
    pub fn get(&self, pos: usize) -> Option<&T> {
        if self.in_window(pos) {
            self.slots[pos].as_ref()
        } else {
            None
        }
    }

    /// Mutable metadata at `pos`, if it is still outstanding
    pub fn get_mut(&mut self, pos: usize) -> Option<&mut T> {
        if self.in_window(pos) {
            self.slots[pos].as_mut()
        } else {
            None
        }
    }

    /// Iterate outstanding slots in posting order
    pub fn outstanding(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        let size = self.size();
        (0..self.occupancy()).filter_map(move |i| {
            let pos = ring_idx_add(self.next_to_clean, i, size);
            self.slots[pos].as_ref().map(|d| (pos, d))
        })
    }

    /// Number of slots still holding metadata
    pub fn outstanding_count(&self) -> usize {
        self.outstanding().count()
    }

    /// Take every outstanding entry and return the ring to the empty state
    pub fn drain_all(&mut self) -> Vec<T> {
        let drained = self.slots.iter_mut().filter_map(Option::take).collect();
        self.next_to_use = 0;
        self.next_to_clean = 0;
        drained
    }

    /// Drop every outstanding entry and return to the empty state
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next_to_use = 0;
        self.next_to_clean = 0;
    }

    /// Verify the occupancy invariant
    ///
    /// Every slot outside `[next_to_clean, next_to_use)` must be empty, and the
    /// slot at `next_to_clean` must be occupied unless the ring is empty.
    pub fn check_invariants(&self) -> Result<(), RingError> {
        let size = self.size();
        if self.next_to_use >= size || self.next_to_clean >= size {
            return Err(RingError::Corrupted(format!(
                "index out of range (next_to_use={}, next_to_clean={}, size={})",
                self.next_to_use, self.next_to_clean, size
            )));
        }

        if !self.is_empty() && self.slots[self.next_to_clean].is_none() {
            return Err(RingError::Corrupted(format!(
                "next_to_clean={} points at a reclaimed slot",
                self.next_to_clean
            )));
        }

        let stray = (0..size)
            .filter(|&pos| !self.in_window(pos) && self.slots[pos].is_some())
            .count();
        if stray > 0 {
            return Err(RingError::Corrupted(format!(
                "{} host-owned slots still hold buffers (next_to_use={}, next_to_clean={})",
                stray, self.next_to_use, self.next_to_clean
            )));
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_indices(&mut self, next_to_use: usize, next_to_clean: usize) {
        self.next_to_use = next_to_use;
        self.next_to_clean = next_to_clean;
    }
}

/// Capacity-bounded stack of TX request ids
///
/// Completions can arrive in any order, so request ids are decoupled from
/// ring positions. An id returns to the pool only after its completion was
/// observed and its buffer unmapped.
#[derive(Debug)]
pub struct FreeIdPool {
    ids: Box<[u16]>,
    top: usize,
    present: Box<[bool]>,
}

impl FreeIdPool {
    /// Create a fully populated pool of ids `0..capacity`
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidSize`] if `capacity` is zero or larger
    /// than [`MAX_RING_SIZE`].
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 || capacity > MAX_RING_SIZE {
            return Err(RingError::InvalidSize(capacity));
        }
        let mut pool = Self {
            ids: vec![0; capacity].into_boxed_slice(),
            top: 0,
            present: vec![false; capacity].into_boxed_slice(),
        };
        pool.reset();
        Ok(pool)
    }

    /// Refill the pool so that ids pop in ascending order
    pub fn reset(&mut self) {
        let capacity = self.ids.len();
        for (slot, id) in self.ids.iter_mut().zip((0..capacity).rev()) {
            *slot = id as u16;
        }
        self.present.fill(true);
        self.top = capacity;
    }

    /// Take a free id
    pub fn pop(&mut self) -> Option<u16> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        let id = self.ids[self.top];
        self.present[id as usize] = false;
        Some(id)
    }

    /// Return an id to the pool
    ///
    /// Returns `false` (and leaves the pool untouched) for ids that are out of
    /// range or already free.
    pub fn push(&mut self, id: u16) -> bool {
        let idx = id as usize;
        if idx >= self.present.len() || self.present[idx] {
            return false;
        }
        self.ids[self.top] = id;
        self.top += 1;
        self.present[idx] = true;
        true
    }

    /// True if `id` is currently free
    pub fn contains(&self, id: u16) -> bool {
        self.present.get(id as usize).copied().unwrap_or(false)
    }

    /// Number of free ids
    pub fn len(&self) -> usize {
        self.top
    }

    /// True if no id is free
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// Total number of ids
    pub fn capacity(&self) -> usize {
        self.ids.len()
    }
}
