//! Time-based lookup and timecode output
//!
//! The engine's time base is normalized so that `pts * num / den` yields
//! milliseconds, which is what both the lookup rounding and the v2 timecode
//! format expect.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use videoseek_common::{Rational, Result};

use crate::index::FrameInfo;

/// Convert seconds to a target PTS in the track time base. The extra 0.001 ms
/// disambiguates half-unit timestamps.
#[must_use]
pub fn target_pts_for_time(time_base: Rational, seconds: f64) -> i64 {
    ((seconds * 1000.0 * f64::from(time_base.den)) / f64::from(time_base.num) + 0.001).round()
        as i64
}

/// Frame whose PTS is closest to `target_pts`; ties go to the left neighbor.
#[must_use]
pub fn frame_number_by_pts(frames: &[FrameInfo], target_pts: i64) -> i64 {
    let idx = frames.partition_point(|f| f.pts < target_pts);
    if idx == frames.len() {
        return frames.len() as i64 - 1;
    }
    if idx == 0 {
        return 0;
    }
    let right = frames[idx].pts.abs_diff(target_pts);
    let left = frames[idx - 1].pts.abs_diff(target_pts);
    if right < left {
        idx as i64
    } else {
        idx as i64 - 1
    }
}

/// Write a `# timecode format v2` file: one millisecond timestamp per frame.
pub fn write_timecodes(frames: &[FrameInfo], time_base: Rational, path: &Path) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# timecode format v2")?;
    for frame in frames {
        let ms = frame.pts as f64 * f64::from(time_base.num) / f64::from(time_base.den);
        writeln!(w, "{ms:.2}")?;
    }
    w.flush()?;
    Ok(())
}
