//! Decoder seam
//!
//! The engine drives decoders through this object-safe trait rather than
//! touching FFmpeg directly. Production uses [`crate::ffmpeg::FfmpegOpener`];
//! tests plug in a deterministic synthetic backend through the same seam.

use videoseek_common::{Result, VideoProperties};

use crate::frame::VideoFrame;

/// Reported frame number of a handle that has seeked but whose position has
/// not been re-established yet.
pub const FRAME_NUMBER_UNKNOWN: i64 = i64::MIN;

/// One open demuxer + codec pair positioned somewhere in the track.
pub trait Decoder: Send {
    /// Decode and return the next frame, or `None` at end of stream or on an
    /// unrecoverable codec error. Advances the reported frame number on every
    /// delivered frame.
    fn next_frame(&mut self) -> Option<VideoFrame>;

    /// Decode and discard `count` frames. Returns false once the stream ends.
    fn skip_frames(&mut self, count: i64) -> bool;

    /// Whether the last decode attempt succeeded (more frames may follow).
    fn has_more_frames(&self) -> bool;

    /// Keyframe-backward seek to `pts`, flushing codec state. The reported
    /// frame number becomes [`FRAME_NUMBER_UNKNOWN`] until the engine
    /// re-identifies the position. Returns false if the demuxer rejects the
    /// seek; the handle is then unseekable.
    fn seek(&mut self, pts: i64) -> bool;

    /// True once `seek` has ever been called on this handle.
    fn has_seeked(&self) -> bool;

    fn frame_number(&self) -> i64;

    /// Fix the reported frame number after seek-and-verify identified it.
    fn set_frame_number(&mut self, n: i64);

    /// Total source size in bytes, for progress reporting.
    fn source_size(&self) -> i64;

    /// Current demuxer byte position, for progress reporting.
    fn source_position(&self) -> i64;

    /// Resolved zero-based stream index.
    fn track(&self) -> i32;

    /// Extract track properties. Decodes (and consumes) the first frame, since
    /// codec context values are unreliable before any decode. Must be called
    /// on a fresh handle.
    fn read_properties(&mut self) -> Result<VideoProperties>;
}

/// Opens fresh [`Decoder`] handles for one configured source track.
pub trait DecoderOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn Decoder>>;
}

/// Codec thread count heuristic: an explicit request wins; otherwise software
/// decoding gets up to 16 threads, CUDA H.264 must stay single-threaded and
/// other CUDA codecs get at most 2.
#[must_use]
pub fn decoder_thread_count(requested: i32, cuda: bool, h264: bool) -> i32 {
    if requested >= 1 {
        return requested;
    }
    let hardware_concurrency = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1);
    if !cuda {
        hardware_concurrency.min(16)
    } else if h264 {
        1
    } else {
        hardware_concurrency.min(2)
    }
}
