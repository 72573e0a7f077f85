//! Synthetic decoder backend for engine scenario tests
//!
//! Emulates the parts of a real demuxer + codec the engine depends on:
//! keyframe-backward PTS seeking, linear delivery with per-frame payloads,
//! end of stream, and the two interesting failure modes (unseekable
//! containers and seeks that land on the wrong GOP).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use videoseek_common::{
    ColorFamily, FrameFormat, HdrMetadata, Rational, Result, Stereo3DInfo, VideoProperties,
};
use videoseek_source::decoder::{Decoder, DecoderOpener, FRAME_NUMBER_UNKNOWN};
use videoseek_source::frame::{ColorInfo, Plane, VideoFrame};

pub const FRAME_WIDTH: usize = 16;
pub const FRAME_HEIGHT: usize = 8;
pub const FRAME_BYTES: usize = FRAME_WIDTH * FRAME_HEIGHT;
/// Milliseconds per synthetic frame.
pub const FRAME_DURATION: i64 = 42;

#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub pts: i64,
    pub key_frame: bool,
    pub repeat_pict: i32,
    pub top_field_first: bool,
    /// Equal seeds produce byte-identical payloads (and therefore hashes).
    pub payload_seed: u64,
}

#[derive(Debug, Default)]
pub struct StreamSpec {
    pub frames: Vec<FrameSpec>,
    /// When false every seek is rejected, like a pipe or broken container.
    pub seekable: bool,
    /// Seeks targeting this PTS land on the mapped frame instead of the
    /// correct keyframe (wrong-GOP delivery).
    pub seek_landing: HashMap<i64, usize>,
}

impl StreamSpec {
    /// Constant-frame-rate stream with unique payloads and a keyframe every
    /// `keyframe_interval` frames.
    pub fn cfr(num_frames: usize, keyframe_interval: usize) -> Self {
        let frames = (0..num_frames)
            .map(|n| FrameSpec {
                pts: n as i64 * FRAME_DURATION,
                key_frame: n % keyframe_interval == 0,
                repeat_pict: 0,
                top_field_first: false,
                payload_seed: 0x9000 + n as u64,
            })
            .collect();
        Self {
            frames,
            seekable: true,
            seek_landing: HashMap::new(),
        }
    }

    /// Index of the latest keyframe whose PTS is at or before `pts`.
    fn keyframe_at_or_before(&self, pts: i64) -> usize {
        let mut landing = 0;
        for (i, frame) in self.frames.iter().enumerate() {
            if frame.key_frame && frame.pts <= pts {
                landing = i;
            }
        }
        landing
    }
}

/// Deterministic per-seed payload, shared by the decoder and by test
/// assertions about merged fields.
pub fn payload(seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15) | 1;
    (0..FRAME_BYTES)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 56) as u8
        })
        .collect()
}

pub fn gray_format() -> FrameFormat {
    FrameFormat {
        color_family: ColorFamily::Gray,
        bits: 8,
        bytes_per_sample: 1,
        alpha: false,
        float_samples: false,
        sub_sampling_w: 0,
        sub_sampling_h: 0,
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    opens: AtomicUsize,
    alive: AtomicUsize,
    max_alive: AtomicUsize,
    decoded: AtomicUsize,
    seeks: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }
    pub fn decoded(&self) -> usize {
        self.decoded.load(Ordering::SeqCst)
    }
    pub fn seeks(&self) -> usize {
        self.seeks.load(Ordering::SeqCst)
    }

    fn on_open(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_alive.fetch_max(alive, Ordering::SeqCst);
    }
    fn on_drop(&self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockOpener {
    stream: Arc<StreamSpec>,
    counters: Arc<Counters>,
}

impl MockOpener {
    pub fn new(stream: Arc<StreamSpec>) -> (Arc<Self>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Arc::new(Self {
                stream,
                counters: counters.clone(),
            }),
            counters,
        )
    }
}

impl DecoderOpener for MockOpener {
    fn open(&self) -> Result<Box<dyn Decoder>> {
        self.counters.on_open();
        Ok(Box::new(MockDecoder {
            stream: self.stream.clone(),
            counters: self.counters.clone(),
            position: 0,
            reported: 0,
            seeked: false,
            decode_ok: true,
        }))
    }
}

pub struct MockDecoder {
    stream: Arc<StreamSpec>,
    counters: Arc<Counters>,
    /// Actual decode position (next frame to deliver)
    position: usize,
    /// Frame number as reported to the engine
    reported: i64,
    seeked: bool,
    decode_ok: bool,
}

impl MockDecoder {
    fn build_frame(&self, n: usize) -> VideoFrame {
        let spec = &self.stream.frames[n];
        let mut plane = Plane::new(FRAME_WIDTH, FRAME_HEIGHT);
        plane.data.copy_from_slice(&payload(spec.payload_seed));
        VideoFrame {
            format: gray_format(),
            width: FRAME_WIDTH as i32,
            height: FRAME_HEIGHT as i32,
            planes: vec![plane],
            pts: spec.pts,
            duration: FRAME_DURATION,
            repeat_pict: spec.repeat_pict,
            key_frame: spec.key_frame,
            top_field_first: spec.top_field_first,
            interlaced: spec.repeat_pict != 0,
            pict_type: if spec.key_frame { 'I' } else { 'P' },
            color: ColorInfo::default(),
            hdr: HdrMetadata::default(),
            dovi_rpu: None,
            hdr10_plus: None,
        }
    }
}

impl Drop for MockDecoder {
    fn drop(&mut self) {
        self.counters.on_drop();
    }
}

impl Decoder for MockDecoder {
    fn next_frame(&mut self) -> Option<VideoFrame> {
        if !self.decode_ok {
            return None;
        }
        if self.position >= self.stream.frames.len() {
            self.decode_ok = false;
            return None;
        }
        let frame = self.build_frame(self.position);
        self.position += 1;
        self.reported = self.reported.wrapping_add(1);
        self.counters.decoded.fetch_add(1, Ordering::SeqCst);
        Some(frame)
    }

    fn skip_frames(&mut self, mut count: i64) -> bool {
        while count > 0 && self.decode_ok {
            if self.position < self.stream.frames.len() {
                self.position += 1;
                self.reported = self.reported.wrapping_add(1);
            } else {
                self.decode_ok = false;
            }
            count -= 1;
        }
        self.decode_ok
    }

    fn has_more_frames(&self) -> bool {
        self.decode_ok
    }

    fn seek(&mut self, pts: i64) -> bool {
        self.counters.seeks.fetch_add(1, Ordering::SeqCst);
        self.seeked = true;
        self.reported = FRAME_NUMBER_UNKNOWN;
        if !self.stream.seekable {
            self.decode_ok = false;
            return false;
        }
        self.position = match self.stream.seek_landing.get(&pts) {
            Some(&landing) => landing,
            None => self.stream.keyframe_at_or_before(pts),
        };
        self.decode_ok = true;
        true
    }

    fn has_seeked(&self) -> bool {
        self.seeked
    }

    fn frame_number(&self) -> i64 {
        self.reported
    }

    fn set_frame_number(&mut self, n: i64) {
        self.reported = n;
    }

    fn source_size(&self) -> i64 {
        (self.stream.frames.len() * FRAME_BYTES) as i64
    }

    fn source_position(&self) -> i64 {
        (self.position * FRAME_BYTES) as i64
    }

    fn track(&self) -> i32 {
        0
    }

    fn read_properties(&mut self) -> Result<VideoProperties> {
        let first = self
            .next_frame()
            .expect("synthetic stream always has a first frame");
        Ok(VideoProperties {
            width: first.width,
            height: first.height,
            format: first.format,
            fps: Rational::new(24, 1),
            sar: Rational::new(0, 1),
            // PTS values are already milliseconds.
            time_base: Rational::new(1, 1),
            num_frames: -1,
            num_rff_frames: -1,
            duration: 0,
            start_time: first.pts as f64 / 1000.0,
            rotation: 0,
            flip_horizontal: false,
            flip_vertical: false,
            stereo3d: Stereo3DInfo::default(),
            hdr: HdrMetadata::default(),
        })
    }
}

/// Create a small stand-in source file so the engine can key the index cache
/// on its size.
pub fn write_source_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"synthetic source payload").expect("write source stub");
    path
}
