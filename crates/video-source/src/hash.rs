//! Frame content hashing
//!
//! The index identifies every decoded frame by a 64-bit XXH3 digest of its
//! visible pixel payload. The digest feeds planes in native order and only the
//! visible bytes of each row, which is exactly what [`VideoFrame`] stores, so
//! hashes are stable across decoder linesize choices. The cache file format
//! depends on this algorithm; do not change it without bumping the index
//! version.

use xxhash_rust::xxh3::Xxh3;

use crate::frame::VideoFrame;

pub const HASH_SIZE: usize = 8;

/// Content hash over the visible pixel payload, truncated to 8 LE bytes.
#[must_use]
pub fn frame_hash(frame: &VideoFrame) -> [u8; HASH_SIZE] {
    let mut state = Xxh3::new();
    for plane in &frame.planes {
        debug_assert_eq!(plane.data.len(), plane.row_bytes * plane.rows);
        state.update(&plane.data);
    }
    state.digest().to_le_bytes()
}
