//! Track index
//!
//! A full linear decode pass over the selected track, recording for every
//! frame the data needed to re-identify it later: presentation timestamp,
//! repeat-field count, keyframe and field-order flags, and the content hash.
//! The index is immutable once built and is what makes seeking verifiable.

use std::time::{Duration, Instant};

use tracing::{debug, info};
use videoseek_common::{Result, SourceError};

use crate::decoder::Decoder;
use crate::hash::{frame_hash, HASH_SIZE};

/// Progress callback: `(track, current_bytes, total_bytes)`. A terminal call
/// with both values at `i64::MAX` signals completion.
pub type ProgressFn<'a> = &'a mut dyn FnMut(i32, i64, i64);

/// Minimum interval between progress reports.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// One indexed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub pts: i64,
    pub repeat_pict: i32,
    pub key_frame: bool,
    pub top_field_first: bool,
    pub hash: [u8; HASH_SIZE],
}

/// Immutable per-track frame index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackIndex {
    pub frames: Vec<FrameInfo>,
    /// Duration of the last frame in time-base ticks
    pub last_frame_duration: i64,
}

impl TrackIndex {
    #[must_use]
    pub fn num_frames(&self) -> i64 {
        self.frames.len() as i64
    }

    /// Total field count, `repeat_pict + 2` per frame.
    #[must_use]
    pub fn num_fields(&self) -> i64 {
        self.frames
            .iter()
            .map(|f| i64::from(f.repeat_pict) + 2)
            .sum()
    }

    /// Logical frame count after repeat-field expansion.
    #[must_use]
    pub fn num_rff_frames(&self) -> i64 {
        (self.num_fields() + 1) / 2
    }
}

/// Decode the whole track through `decoder` and build its index.
///
/// # Errors
///
/// `IndexBuildFailed` if no frame could be decoded or any frame reports a
/// negative `repeat_pict` (an unhandled codec quirk).
pub fn index_track(decoder: &mut dyn Decoder, mut progress: Option<ProgressFn<'_>>) -> Result<TrackIndex> {
    let track = decoder.track();
    let total_bytes = decoder.source_size();
    let mut index = TrackIndex::default();
    let mut last_report = Instant::now();

    info!(track, "building track index");

    while let Some(frame) = decoder.next_frame() {
        if frame.repeat_pict < 0 {
            return Err(SourceError::IndexBuildFailed(format!(
                "frame {} reports repeat_pict = {}, please submit a bug report and attach the source file",
                index.frames.len(),
                frame.repeat_pict
            )));
        }

        index.frames.push(FrameInfo {
            pts: frame.pts,
            repeat_pict: frame.repeat_pict,
            key_frame: frame.key_frame,
            top_field_first: frame.top_field_first,
            hash: frame_hash(&frame),
        });
        index.last_frame_duration = frame.duration;

        if let Some(report) = progress.as_mut() {
            if last_report.elapsed() >= PROGRESS_INTERVAL {
                report(track, decoder.source_position(), total_bytes);
                last_report = Instant::now();
            }
        }
    }

    if let Some(report) = progress.as_mut() {
        report(track, i64::MAX, i64::MAX);
    }

    if index.frames.is_empty() {
        return Err(SourceError::IndexBuildFailed(
            "no frames could be decoded".to_string(),
        ));
    }

    debug!(
        track,
        frames = index.frames.len(),
        fields = index.num_fields(),
        "track index complete"
    );

    Ok(index)
}
