//! Decoded frame cache
//!
//! Byte-budget LRU over decoded frames keyed by ordinal frame number. Frames
//! are shared out as `Arc` clones, so a cached frame handed to a caller stays
//! valid after eviction.

use std::sync::Arc;

use lru::LruCache;

use crate::frame::VideoFrame;

/// Default budget: 1 GiB of pixel payload.
pub const DEFAULT_MAX_CACHE_BYTES: usize = 1 << 30;

pub struct FrameCache {
    entries: LruCache<i64, Arc<VideoFrame>>,
    bytes: usize,
    max_bytes: usize,
}

impl FrameCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            max_bytes: DEFAULT_MAX_CACHE_BYTES,
        }
    }

    /// Fetch frame `n`, promoting it to most recently used.
    pub fn get(&mut self, n: i64) -> Option<Arc<VideoFrame>> {
        self.entries.get(&n).cloned()
    }

    /// Insert frame `n`. An already-cached copy of the same ordinal is
    /// replaced, never duplicated. May immediately evict down to budget,
    /// including the new entry if it alone exceeds it.
    pub fn insert(&mut self, n: i64, frame: Arc<VideoFrame>) {
        self.bytes += frame.payload_size();
        if let Some(old) = self.entries.put(n, frame) {
            self.bytes -= old.payload_size();
        }
        self.apply_max_size();
    }

    pub fn set_max_size(&mut self, bytes: usize) {
        self.max_bytes = bytes;
        self.apply_max_size();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current payload bytes held; always within budget after any public call.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn apply_max_size(&mut self) {
        while self.bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, old)) => self.bytes -= old.payload_size(),
                None => break,
            }
        }
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}
