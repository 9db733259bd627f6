//! Adaptive interrupt moderation
//!
//! Each ring owns a [`ModerationController`] that watches how many entries
//! every interrupt batch carried and walks an ordered table of coalescing
//! intervals:
//!
//! - a smoothed rate (EWMA, weight `1 / 2^ewma_shift`) tracks load;
//! - `up_after_batches` consecutive batches of at least `ring_size / 4`
//!   entries, with the smoothed rate at or above half that watermark, move
//!   one level up;
//! - an empty batch, or a smoothed rate below `ring_size / 64`, moves one
//!   level down.
//!
//! With adaptation disabled the controller reports a fixed interval and never
//! changes it.

use crate::config::ModerationConfig;
use crate::device::Direction;

/// Fixed-point fraction bits of the smoothed rate
const EWMA_FRAC_BITS: u32 = 8;

/// Per-ring coalescing interval controller
#[derive(Debug, Clone)]
pub struct ModerationController {
    levels: Vec<u32>,
    level: usize,
    adaptive: bool,
    static_usecs: u32,
    ewma_shift: u32,
    up_after_batches: u32,
    high_watermark: u64,
    low_watermark: u64,
    smoothed_fp: u64,
    busy_batches: u32,
}

impl ModerationController {
    /// Controller for a ring of `ring_size` entries
    pub fn new(config: &ModerationConfig, ring_size: usize, direction: Direction) -> Self {
        let static_usecs = match direction {
            Direction::Tx => config.tx_usecs,
            Direction::Rx => config.rx_usecs,
        };
        let levels = if config.levels_usecs.is_empty() {
            vec![static_usecs]
        } else {
            config.levels_usecs.clone()
        };

        Self {
            levels,
            level: 0,
            adaptive: config.adaptive,
            static_usecs,
            ewma_shift: config.ewma_shift,
            up_after_batches: config.up_after_batches.max(1),
            high_watermark: (ring_size as u64 / 4).max(1),
            low_watermark: ring_size as u64 / 64,
            smoothed_fp: 0,
            busy_batches: 0,
        }
    }

    /// Whether intervals follow the traffic
    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Current level index
    pub fn level(&self) -> usize {
        self.level
    }

    /// Interval that should currently be programmed
    pub fn interval_usecs(&self) -> u32 {
        if self.adaptive {
            self.levels[self.level]
        } else {
            self.static_usecs
        }
    }

    /// Smoothed entries per batch
    pub fn smoothed_rate(&self) -> u64 {
        self.smoothed_fp >> EWMA_FRAC_BITS
    }

    /// Record one interrupt batch of `entries` completions
    ///
    /// Returns the new interval when the level changed.
    pub fn observe(&mut self, entries: usize) -> Option<u32> {
        if !self.adaptive {
            return None;
        }

        let sample = (entries as u64) << EWMA_FRAC_BITS;
        if sample >= self.smoothed_fp {
            self.smoothed_fp += (sample - self.smoothed_fp) >> self.ewma_shift;
        } else {
            self.smoothed_fp -= (self.smoothed_fp - sample) >> self.ewma_shift;
        }

        if entries as u64 >= self.high_watermark {
            self.busy_batches = self.busy_batches.saturating_add(1);
        } else {
            self.busy_batches = 0;
        }

        let smoothed = self.smoothed_rate();
        if entries == 0 || smoothed < self.low_watermark {
            self.busy_batches = 0;
            return self.step_down();
        }

        if self.busy_batches >= self.up_after_batches && smoothed >= self.high_watermark / 2 {
            self.busy_batches = 0;
            return self.step_up();
        }

        None
    }

    /// Forget history and return to the lowest level
    pub fn reset(&mut self) {
        self.level = 0;
        self.smoothed_fp = 0;
        self.busy_batches = 0;
    }

    fn step_up(&mut self) -> Option<u32> {
        if self.level + 1 < self.levels.len() {
            self.level += 1;
            tracing::debug!(
                "Moderation level up to {} ({} us)",
                self.level,
                self.levels[self.level]
            );
            Some(self.levels[self.level])
        } else {
            None
        }
    }

    fn step_down(&mut self) -> Option<u32> {
        if self.level > 0 {
            self.level -= 1;
            tracing::debug!(
                "Moderation level down to {} ({} us)",
                self.level,
                self.levels[self.level]
            );
            Some(self.levels[self.level])
        } else {
            None
        }
    }
}
