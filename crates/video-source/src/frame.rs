//! Owned decoded frames
//!
//! Frames cross the decoder seam as tightly packed planar buffers: each plane is
//! copied row by row with the linesize padding stripped, so the stored bytes are
//! exactly the visible payload. Hashing and field merging operate on these
//! buffers directly.

use videoseek_common::{FrameFormat, HdrMetadata, Result, SourceError};

/// One tightly packed image plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Visible bytes per row; also the row stride of `data`
    pub row_bytes: usize,
    pub rows: usize,
}

impl Plane {
    #[must_use]
    pub fn new(row_bytes: usize, rows: usize) -> Self {
        Self {
            data: vec![0; row_bytes * rows],
            row_bytes,
            rows,
        }
    }

    #[must_use]
    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.row_bytes..(r + 1) * self.row_bytes]
    }
}

/// Per-frame color description, numeric values as reported by the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorInfo {
    pub matrix: i32,
    pub primaries: i32,
    pub transfer: i32,
    pub range: i32,
    pub chroma_location: i32,
}

/// A decoded frame with its pixel payload and per-frame metadata.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub format: FrameFormat,
    pub width: i32,
    pub height: i32,
    /// Planes in demuxer-native order (Y, U, V, A)
    pub planes: Vec<Plane>,
    pub pts: i64,
    /// Frame duration in time-base ticks; 0 when unknown
    pub duration: i64,
    /// Extra fields to display; `-1` is a codec quirk the engine rejects
    pub repeat_pict: i32,
    pub key_frame: bool,
    pub top_field_first: bool,
    pub interlaced: bool,
    pub pict_type: char,
    pub color: ColorInfo,
    pub hdr: HdrMetadata,
    /// Dolby Vision RPU payload, copied out of frame side data
    pub dovi_rpu: Option<Vec<u8>>,
    /// HDR10+ dynamic metadata payload, copied out of frame side data
    pub hdr10_plus: Option<Vec<u8>>,
}

impl VideoFrame {
    /// Total pixel payload bytes, used for cache accounting.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }

    /// Overwrite this frame's lines of one field parity with the matching lines
    /// of `other`. `top == true` replaces the even rows (a top-field merge into
    /// a bottom-sourced frame), `top == false` the odd rows.
    ///
    /// # Errors
    ///
    /// `FormatMismatch` unless both frames have identical format and dimensions.
    pub fn merge_field(&mut self, top: bool, other: &VideoFrame) -> Result<()> {
        if self.format != other.format
            || self.width != other.width
            || self.height != other.height
            || self.planes.len() != other.planes.len()
        {
            return Err(SourceError::FormatMismatch(
                "merged frames must have the same format".to_string(),
            ));
        }

        let start = usize::from(!top);
        for (dst, src) in self.planes.iter_mut().zip(&other.planes) {
            debug_assert_eq!(dst.row_bytes, src.row_bytes);
            debug_assert_eq!(dst.rows, src.rows);
            let row_bytes = dst.row_bytes;
            for r in (start..dst.rows).step_by(2) {
                dst.data[r * row_bytes..(r + 1) * row_bytes].copy_from_slice(src.row(r));
            }
        }
        Ok(())
    }
}
