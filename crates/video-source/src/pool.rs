//! Warm decoder pool
//!
//! A fixed array of decoder slots with monotonic last-used counters. Keeping a
//! few positioned decoders warm turns most forward requests into linear
//! continuation instead of a fresh open + seek.

use crate::decoder::Decoder;

/// Maximum concurrently open decoders per engine.
pub const MAX_VIDEO_SOURCES: usize = 4;

#[derive(Default)]
pub struct DecoderPool {
    slots: [Option<Box<dyn Decoder>>; MAX_VIDEO_SOURCES],
    last_used: [u64; MAX_VIDEO_SOURCES],
    sequence: u64,
}

impl DecoderPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot whose decoder can continue linearly to `n` without seeking, i.e.
    /// is positioned in `[low, n]`.
    #[must_use]
    pub fn continuation_slot(&self, low: i64, n: i64) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|d| d.frame_number() >= low && d.frame_number() <= n)
        })
    }

    /// Occupied slot best placed for a linear run to `n`: positioned at or
    /// before `n`, closest to it, optionally restricted to never-seeked
    /// handles.
    #[must_use]
    pub fn best_linear_slot(&self, n: i64, force_unseeked: bool) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(decoder) = slot.as_ref() else {
                continue;
            };
            if force_unseeked && decoder.has_seeked() {
                continue;
            }
            if decoder.frame_number() > n {
                continue;
            }
            let better = match best {
                Some(b) => self.slots[b].as_ref().is_some_and(|prev| {
                    prev.frame_number() < decoder.frame_number()
                }),
                None => true,
            };
            if better {
                best = Some(i);
            }
        }
        best
    }

    /// Where to place a new decoder: an empty slot if any, else the least
    /// recently used one (whose occupant gets dropped on `put`).
    #[must_use]
    pub fn free_or_lru_slot(&self) -> usize {
        if let Some(empty) = self.slots.iter().position(Option::is_none) {
            return empty;
        }
        let mut lru = 0;
        for i in 1..MAX_VIDEO_SOURCES {
            if self.last_used[i] < self.last_used[lru] {
                lru = i;
            }
        }
        lru
    }

    pub fn touch(&mut self, slot: usize) {
        self.last_used[slot] = self.sequence;
        self.sequence += 1;
    }

    pub fn take(&mut self, slot: usize) -> Option<Box<dyn Decoder>> {
        self.slots[slot].take()
    }

    pub fn put(&mut self, slot: usize, decoder: Box<dyn Decoder>) {
        self.slots[slot] = Some(decoder);
    }

    /// Drop every open decoder (the transition to forced linear mode).
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
