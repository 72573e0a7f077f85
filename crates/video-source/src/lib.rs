//! Frame-accurate random access to video files
//!
//! `videoseek_source` turns a container + codec decodable file into an
//! addressable sequence of frames: build (or load) a per-track content-hash
//! index once, then request any frame by ordinal number or presentation time
//! and get back exactly the pixels a full linear decode would have produced
//! at that position.
//!
//! ```no_run
//! use videoseek_source::{SourceOptions, VideoSource};
//!
//! # fn main() -> videoseek_common::Result<()> {
//! let source = VideoSource::open("clip.mkv", SourceOptions::default())?;
//! let props = source.video_properties();
//! let frame = source.get_frame(props.num_frames / 2, false)?;
//! # Ok(())
//! # }
//! ```
//!
//! Seeks are verified: decoded frames are matched against the indexed hashes
//! and anchors that produce wrong or ambiguous output are blacklisted and
//! retried further back, falling back to linear decoding when a file defeats
//! seeking entirely. Identical requests therefore return bit-identical
//! frames, whatever access order came before them.

pub mod cache;
pub mod decoder;
pub mod ffmpeg;
pub mod frame;
pub mod hash;
pub mod index;
pub mod persist;
pub mod pool;
pub mod rff;
pub mod source;
pub mod time;

pub use cache::DEFAULT_MAX_CACHE_BYTES;
pub use decoder::{Decoder, DecoderOpener, FRAME_NUMBER_UNKNOWN};
pub use ffmpeg::{set_ffmpeg_log_level, FfmpegDecoder, FfmpegOpener};
pub use frame::{ColorInfo, Plane, VideoFrame};
pub use hash::{frame_hash, HASH_SIZE};
pub use index::{FrameInfo, TrackIndex};
pub use pool::MAX_VIDEO_SOURCES;
pub use source::{SourceOptions, VideoSource};

pub use videoseek_common::{
    ColorFamily, FrameFormat, HdrMetadata, Rational, Result, SourceError, VideoProperties,
    PTS_NONE,
};
