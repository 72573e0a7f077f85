/// Common types and utilities for frame-accurate video access
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open source: {0}")]
    OpenFailed(String),

    #[error("Bad track: {0}")]
    BadTrack(String),

    #[error("Index build failed: {0}")]
    IndexBuildFailed(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("FFmpeg error: {0}")]
    FFmpegError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Sentinel PTS for frames the container cannot address (`AV_NOPTS_VALUE`).
pub const PTS_NONE: i64 = i64::MIN;

/// Rational number, typically a time base or an aspect ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    #[must_use]
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }

    /// Reduce by the greatest common divisor, keeping the denominator positive.
    #[must_use]
    pub fn reduced(self) -> Self {
        fn gcd(a: i64, b: i64) -> i64 {
            if b == 0 {
                a.abs()
            } else {
                gcd(b, a % b)
            }
        }
        let g = gcd(i64::from(self.num), i64::from(self.den)).max(1) as i32;
        let (mut num, mut den) = (self.num / g, self.den / g);
        if den < 0 {
            num = -num;
            den = -den;
        }
        Self { num, den }
    }
}

/// Basic color family of a pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFamily {
    Gray,
    Rgb,
    Yuv,
}

/// Shape of the decoded pixel data, independent of any one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub color_family: ColorFamily,
    /// Significant bits per component
    pub bits: i32,
    /// Storage bytes per component
    pub bytes_per_sample: usize,
    pub alpha: bool,
    pub float_samples: bool,
    /// log2 horizontal chroma subsampling
    pub sub_sampling_w: i32,
    /// log2 vertical chroma subsampling
    pub sub_sampling_h: i32,
}

/// Display mastering primaries and white point (SMPTE ST 2086), as rationals in CIE xy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasteringDisplayPrimaries {
    pub primaries: [[Rational; 2]; 3],
    pub white_point: [Rational; 2],
}

/// Display mastering luminance range in cd/m².
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasteringDisplayLuminance {
    pub min: Rational,
    pub max: Rational,
}

/// Content light level (MaxCLL / MaxFALL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLightLevel {
    pub max_cll: u32,
    pub max_fall: u32,
}

/// Static HDR metadata attached to a stream or a single frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrMetadata {
    pub mastering_primaries: Option<MasteringDisplayPrimaries>,
    pub mastering_luminance: Option<MasteringDisplayLuminance>,
    pub content_light: Option<ContentLightLevel>,
}

/// Stereoscopic 3D packing reported by the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stereo3DInfo {
    /// `AVStereo3DType` numeric value; 0 = 2D
    pub kind: i32,
    pub flags: u32,
}

/// Track-level properties derived from the container, the codec and the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoProperties {
    pub width: i32,
    pub height: i32,
    pub format: FrameFormat,
    pub fps: Rational,
    /// Sample aspect ratio; 0/1 when unknown
    pub sar: Rational,
    /// Track time base scaled so that `pts * num / den` is milliseconds
    pub time_base: Rational,
    /// Native frame count (index length)
    pub num_frames: i64,
    /// Logical frame count after repeat-field expansion
    pub num_rff_frames: i64,
    /// `last_pts - first_pts + max(1, last_frame_duration)`, in time-base ticks
    pub duration: i64,
    /// First frame presentation time in seconds
    pub start_time: f64,
    /// Counter-clockwise display rotation, degrees in `[0, 360)`
    pub rotation: i32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub stereo3d: Stereo3DInfo,
    pub hdr: HdrMetadata,
}

impl VideoProperties {
    /// True when the repeat-field census found anything to expand.
    #[must_use]
    pub fn uses_rff(&self) -> bool {
        self.num_rff_frames != self.num_frames
    }
}
