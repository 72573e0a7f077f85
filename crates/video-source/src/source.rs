//! Random-access engine
//!
//! `VideoSource` owns one track's index, frame cache and decoder pool and
//! serves arbitrary `get_frame(n)` requests. Seeking is never trusted: after
//! every seek the decoded frames are matched against the index hashes until
//! the position is uniquely identified, and anchors that produce wrong or
//! ambiguous output are blacklisted and retried further back. When seeking
//! proves hopeless the engine falls back to pure linear decoding for the rest
//! of its life.
//
// Request resolution order:
// 1. Frame cache hit.
// 2. A pooled decoder already positioned inside [seek_frame(n), n] continues
//    linearly.
// 3. Targets whose seek anchor would land within the first 100 frames decode
//    linearly from the start (seeking near the head of a file is unreliable
//    in several demuxers).
// 4. Seek to the anchor keyframe and verify hashes until the position is
//    unique, then continue linearly.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use videoseek_common::{Result, SourceError, VideoProperties, PTS_NONE};

use crate::cache::FrameCache;
use crate::decoder::{Decoder, DecoderOpener};
use crate::ffmpeg::FfmpegOpener;
use crate::frame::VideoFrame;
use crate::hash::{frame_hash, HASH_SIZE};
use crate::index::{index_track, FrameInfo, ProgressFn, TrackIndex};
use crate::persist::{index_cache_path, read_index, write_index, IndexMeta};
use crate::pool::DecoderPool;
use crate::rff::{build_field_table, FieldPair};
use crate::time::{frame_number_by_pts, target_pts_for_time, write_timecodes};

/// How many times a failed seek is retried further back before giving up.
const RETRY_SEEK_ATTEMPTS: usize = 3;

/// Seek anchors below this index are not used; such targets decode linearly
/// from the start instead.
const SEEK_FRAME_FLOOR: i64 = 100;

/// Longest hash run used to disambiguate duplicate frames.
const MAX_MATCH_FRAMES: usize = 10;

/// Open configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Hardware device name ("" = software decoding)
    pub hw_device: String,
    pub extra_hw_frames: i32,
    /// Absolute stream index, or negative for the n-th video track (-1 = first)
    pub track: i32,
    /// Allow mid-stream format changes instead of dropping mismatching frames
    pub variable_format: bool,
    /// Codec threads; below 1 picks a per-device heuristic
    pub threads: i32,
    /// Directory for index cache files; `None` places them next to the source
    pub cache_dir: Option<PathBuf>,
    pub demuxer_options: BTreeMap<String, String>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            hw_device: String::new(),
            extra_hw_frames: 0,
            track: -1,
            variable_format: false,
            threads: 0,
            cache_dir: None,
            demuxer_options: BTreeMap::new(),
        }
    }
}

enum RffState {
    Uninitialized,
    Unused,
    Table(Vec<FieldPair>),
}

/// Frame-accurate random access to one video track.
///
/// All mutable state sits behind one mutex, so concurrent `get_frame` calls on
/// the same instance serialize at entry; use one engine per track per thread
/// for parallel decoding.
pub struct VideoSource {
    inner: Mutex<Inner>,
}

struct Inner {
    opener: Arc<dyn DecoderOpener>,
    track: i32,
    props: VideoProperties,
    index: TrackIndex,
    cache: FrameCache,
    pool: DecoderPool,
    bad_seek: HashSet<i64>,
    linear_mode: bool,
    preroll: i64,
    rff: RffState,
}

impl VideoSource {
    /// Open `source` with FFmpeg, loading or building the track index.
    pub fn open<P: AsRef<Path>>(source: P, options: SourceOptions) -> Result<Self> {
        Self::open_with_progress(source, options, None)
    }

    /// Like [`open`](Self::open), reporting index-build progress as
    /// `(track, current_bytes, total_bytes)` at one-second intervals with a
    /// terminal `(i64::MAX, i64::MAX)` call. The callback never fires when a
    /// matching index cache is found.
    pub fn open_with_progress<P: AsRef<Path>>(
        source: P,
        options: SourceOptions,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Self> {
        let source = source.as_ref().to_path_buf();
        let opener = Arc::new(FfmpegOpener::new(source.clone(), options.clone()));
        Self::with_opener(&source, opener, options, progress)
    }

    /// Open through a caller-supplied decoder backend. This is the seam the
    /// test suite uses; `source` must still name an existing file so the index
    /// cache can key on its size.
    pub fn with_opener(
        source: &Path,
        opener: Arc<dyn DecoderOpener>,
        options: SourceOptions,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Self> {
        if options.extra_hw_frames < 0 {
            return Err(SourceError::ArgumentError(
                "extra_hw_frames must be 0 or greater".to_string(),
            ));
        }

        let mut decoder = opener.open()?;
        let mut props = decoder.read_properties()?;
        let track = decoder.track();

        let meta = IndexMeta {
            source_size: fs::metadata(source)?.len() as i64,
            track,
            variable_format: options.variable_format,
            hw_device: options.hw_device.clone(),
            demuxer_options: options.demuxer_options.clone(),
        };
        let cache_path = index_cache_path(source, options.cache_dir.as_deref(), track);

        let index = match read_index(&cache_path, &meta) {
            Some(index) => index,
            None => {
                let mut index_decoder = opener.open()?;
                let index = index_track(index_decoder.as_mut(), progress).map_err(|e| {
                    SourceError::IndexBuildFailed(format!(
                        "indexing of '{}' track #{track} failed: {e}",
                        source.display()
                    ))
                })?;
                if let Err(e) = write_index(&cache_path, &meta, &index) {
                    warn!(path = %cache_path.display(), "could not write index cache: {e}");
                }
                index
            }
        };

        if index.frames[0].repeat_pict < 0 {
            return Err(SourceError::IndexBuildFailed(
                "found an unexpected RFF quirk, please submit a bug report and attach the source file"
                    .to_string(),
            ));
        }

        props.num_frames = index.num_frames();
        props.num_rff_frames = index.num_rff_frames();
        props.duration = index.frames[index.frames.len() - 1].pts - index.frames[0].pts
            + index.last_frame_duration.max(1);

        let rff = if props.num_rff_frames == props.num_frames {
            RffState::Unused
        } else {
            RffState::Uninitialized
        };

        let mut pool = DecoderPool::new();
        pool.put(0, decoder);
        pool.touch(0);

        Ok(Self {
            inner: Mutex::new(Inner {
                opener,
                track,
                props,
                index,
                cache: FrameCache::new(),
                pool,
                bad_seek: HashSet::new(),
                linear_mode: false,
                preroll: 0,
                rff,
            }),
        })
    }

    #[must_use]
    pub fn video_properties(&self) -> VideoProperties {
        self.lock().props.clone()
    }

    /// Resolved zero-based stream index.
    #[must_use]
    pub fn track(&self) -> i32 {
        self.lock().track
    }

    /// Fetch frame `n`. Returns `Ok(None)` when `n` is out of range. With
    /// `linear` set the request bypasses seeking and decodes forward from the
    /// best available position.
    pub fn get_frame(&self, n: i64, linear: bool) -> Result<Option<Arc<VideoFrame>>> {
        self.lock().get_frame(n, linear)
    }

    /// Fetch logical frame `n` of the repeat-field-expanded sequence,
    /// synthesizing a merged frame when its fields come from two source
    /// frames.
    pub fn get_frame_with_rff(&self, n: i64) -> Result<Option<Arc<VideoFrame>>> {
        self.lock().get_frame_with_rff(n)
    }

    /// Fetch the frame whose presentation time is closest to `seconds`.
    pub fn get_frame_by_time(&self, seconds: f64) -> Result<Option<Arc<VideoFrame>>> {
        self.lock().get_frame_by_time(seconds)
    }

    /// Field order of frame `n`, in the native (`rff == false`) or
    /// repeat-field-expanded numbering. Out-of-range frames report false.
    #[must_use]
    pub fn get_frame_is_tff(&self, n: i64, rff: bool) -> bool {
        self.lock().get_frame_is_tff(n, rff)
    }

    /// Indexed metadata of frame `n`, or `None` out of range.
    #[must_use]
    pub fn frame_info(&self, n: i64) -> Option<FrameInfo> {
        let inner = self.lock();
        if n < 0 || n >= inner.index.num_frames() {
            return None;
        }
        Some(inner.index.frames[n as usize])
    }

    /// Write a `# timecode format v2` file for the whole track.
    pub fn write_timecodes<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let inner = self.lock();
        write_timecodes(&inner.index.frames, inner.props.time_base, path.as_ref())
    }

    /// Set the frame cache budget in payload bytes (default 1 GiB).
    pub fn set_max_cache_size(&self, bytes: usize) {
        self.lock().cache.set_max_size(bytes);
    }

    /// Decode this many extra frames before a target to absorb out-of-order
    /// output from broken decoders. Valid range 0..=40.
    pub fn set_seek_preroll(&self, frames: i64) -> Result<()> {
        if !(0..=40).contains(&frames) {
            return Err(SourceError::ArgumentError(
                "seek preroll must be between 0 and 40".to_string(),
            ));
        }
        self.lock().preroll = frames;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

impl Inner {
    fn get_frame(&mut self, n: i64, linear: bool) -> Result<Option<Arc<VideoFrame>>> {
        if n < 0 || n >= self.index.num_frames() {
            return Ok(None);
        }
        if let Some(frame) = self.cache.get(n) {
            return Ok(Some(frame));
        }
        if linear {
            self.get_frame_linear(n, -1, 0, false)
        } else {
            self.get_frame_internal(n)
        }
    }

    fn get_frame_internal(&mut self, n: i64) -> Result<Option<Arc<VideoFrame>>> {
        if self.linear_mode {
            return self.get_frame_linear(n, -1, 0, false);
        }

        let seek_frame = self.seek_frame_for(n);

        if seek_frame < SEEK_FRAME_FLOOR {
            return self.get_frame_linear(n, -1, 0, false);
        }

        // A decoder already inside the optimal zone makes seeking pointless.
        if self.pool.continuation_slot(seek_frame, n).is_some() {
            return self.get_frame_linear(n, -1, 0, false);
        }

        let slot = self.pool.free_or_lru_slot();
        let decoder = match self.pool.take(slot) {
            Some(existing) => existing,
            None => self.opener.open()?,
        };
        self.pool.touch(slot);

        self.seek_and_decode(n, seek_frame, decoder, slot, 0)
    }

    /// Latest usable seek anchor for a request: a keyframe at or before
    /// `n - preroll` with a real PTS that is not blacklisted, ignoring
    /// anything below the floor.
    fn seek_frame_for(&self, n: i64) -> i64 {
        let mut i = n - self.preroll;
        while i >= SEEK_FRAME_FLOOR {
            let frame = &self.index.frames[i as usize];
            if frame.key_frame && frame.pts != PTS_NONE && !self.bad_seek.contains(&i) {
                return i;
            }
            i -= 1;
        }
        -1
    }

    fn set_linear_mode(&mut self) {
        debug_assert!(!self.linear_mode);
        if !self.linear_mode {
            debug!("linear mode is now forced");
            self.linear_mode = true;
            self.cache.clear();
            self.pool.clear();
        }
    }

    fn seek_and_decode(
        &mut self,
        n: i64,
        seek_frame: i64,
        mut decoder: Box<dyn Decoder>,
        slot: usize,
        depth: usize,
    ) -> Result<Option<Arc<VideoFrame>>> {
        if !decoder.seek(self.index.frames[seek_frame as usize].pts) {
            debug!(n, "unseekable file");
            drop(decoder);
            self.set_linear_mode();
            return self.get_frame_linear(n, -1, 0, false);
        }

        let mut match_frames: Vec<(Arc<VideoFrame>, [u8; HASH_SIZE])> = Vec::new();

        loop {
            let produced = decoder.next_frame();
            if produced.is_none() && match_frames.is_empty() {
                debug!(
                    n,
                    seek_frame, "no frame could be decoded after seeking, added as bad seek location"
                );
                self.bad_seek.insert(seek_frame);
                return self.retry_seek(n, seek_frame, decoder, slot, depth, false);
            }

            let got_frame = produced.is_some();
            if let Some(frame) = produced {
                let hash = frame_hash(&frame);
                match_frames.push((Arc::new(frame), hash));
            }

            let matches = self.match_positions(&match_frames, got_frame);

            // A match beyond the target is as useless as none: the anchor
            // landed late and only an earlier one can help.
            let suitable = matches.iter().any(|&m| m <= n);
            let undeterminable =
                matches.len() > 1 && (!got_frame || match_frames.len() >= MAX_MATCH_FRAMES);

            if !suitable || undeterminable {
                if undeterminable {
                    debug!(n, seek_frame, "seek location cannot be unambiguously identified");
                } else if matches.is_empty() {
                    debug!(n, seek_frame, "seek location yielded corrupt frames");
                } else {
                    debug!(n, seek_frame, "seek location beyond destination");
                }
                self.bad_seek.insert(seek_frame);
                return self.retry_seek(n, seek_frame, decoder, slot, depth, false);
            }

            if matches.len() == 1 {
                let matched = matches[0];
                if matched < SEEK_FRAME_FLOOR {
                    debug!(n, matched, "seek destination within the start zone, this was unexpected");
                }
                decoder.set_frame_number(matched + match_frames.len() as i64);

                let mut result = None;
                for (k, (frame, _)) in match_frames.iter().enumerate() {
                    let frame_number = matched + k as i64;
                    if frame_number >= n - self.preroll {
                        if frame_number == n {
                            result = Some(frame.clone());
                        }
                        self.cache.insert(frame_number, frame.clone());
                    }
                }

                self.pool.put(slot, decoder);
                if result.is_some() {
                    return Ok(result);
                }
                // Position identified but target not reached yet; continue
                // linearly from here.
                return self.get_frame_linear(n, seek_frame, depth, false);
            }

            // Multiple candidates: decode another frame and match again.
        }
    }

    /// Index positions whose hash run matches every frame decoded since the
    /// seek. Once the stream has ended only the tail position can match.
    fn match_positions(
        &self,
        match_frames: &[(Arc<VideoFrame>, [u8; HASH_SIZE])],
        still_decoding: bool,
    ) -> Vec<i64> {
        let total = self.index.frames.len();
        let len = match_frames.len();
        let run_matches = |start: usize| {
            match_frames
                .iter()
                .enumerate()
                .all(|(j, (_, hash))| self.index.frames[start + j].hash == *hash)
        };

        if still_decoding {
            (0..=total - len)
                .filter(|&i| run_matches(i))
                .map(|i| i as i64)
                .collect()
        } else {
            let tail = total - len;
            if run_matches(tail) {
                vec![tail as i64]
            } else {
                Vec::new()
            }
        }
    }

    fn retry_seek(
        &mut self,
        n: i64,
        seek_frame: i64,
        decoder: Box<dyn Decoder>,
        slot: usize,
        depth: usize,
        force_unseeked_on_giveup: bool,
    ) -> Result<Option<Arc<VideoFrame>>> {
        if depth < RETRY_SEEK_ATTEMPTS {
            let next = self.seek_frame_for(seek_frame - SEEK_FRAME_FLOOR);
            debug!(n, next, "retrying seeking");
            if next < SEEK_FRAME_FLOOR {
                drop(decoder);
                self.get_frame_linear(n, -1, 0, false)
            } else {
                self.seek_and_decode(n, next, decoder, slot, depth + 1)
            }
        } else {
            debug!(n, seek_frame, "maximum number of seek attempts made, setting linear mode");
            drop(decoder);
            self.set_linear_mode();
            self.get_frame_linear(n, -1, 0, force_unseeked_on_giveup)
        }
    }

    fn get_frame_linear(
        &mut self,
        n: i64,
        seek_frame: i64,
        depth: usize,
        force_unseeked: bool,
    ) -> Result<Option<Arc<VideoFrame>>> {
        // Reuse the furthest decoder at or before the target, else open a
        // fresh one in an empty or least recently used slot.
        let reusable = self
            .pool
            .best_linear_slot(n, force_unseeked)
            .and_then(|i| self.pool.take(i).map(|d| (i, d)));
        let (slot, mut decoder) = match reusable {
            Some(pair) => pair,
            None => {
                let slot = self.pool.free_or_lru_slot();
                drop(self.pool.take(slot));
                (slot, self.opener.open()?)
            }
        };
        self.pool.touch(slot);

        let mut result = None;

        while decoder.frame_number() <= n && decoder.has_more_frames() {
            let frame_number = decoder.frame_number();
            if frame_number >= n - self.preroll {
                let produced = decoder.next_frame();
                let verified = produced.as_ref().is_some_and(|f| {
                    frame_hash(f) == self.index.frames[frame_number as usize].hash
                });

                if !verified {
                    // The central sanity check: a decoder that seeked and had
                    // its location identified can still emit frames out of
                    // order (open-GOP damage among other causes).
                    if decoder.has_seeked() {
                        debug!(
                            n,
                            frame_number,
                            "frame hash mismatch after seek, added as bad seek location"
                        );
                        debug_assert!(seek_frame >= 0);
                        self.bad_seek.insert(seek_frame);
                        return self.retry_seek(n, seek_frame, decoder, slot, depth, true);
                    }
                    warn!(
                        n,
                        frame_number,
                        "linear decoding returned a bad frame; try deleting the index and using threads=1"
                    );
                    return Err(SourceError::DecodeError(format!(
                        "frame {frame_number} failed hash verification during linear decode"
                    )));
                }

                if let Some(frame) = produced {
                    let frame = Arc::new(frame);
                    if frame_number == n {
                        result = Some(frame.clone());
                    }
                    self.cache.insert(frame_number, frame);
                }
            } else {
                decoder.skip_frames(n - self.preroll - frame_number);
            }

            if !decoder.has_more_frames() {
                // Exhausted decoders are dropped rather than pooled.
                return Ok(result);
            }
        }

        self.pool.put(slot, decoder);
        Ok(result)
    }

    fn get_frame_with_rff(&mut self, n: i64) -> Result<Option<Arc<VideoFrame>>> {
        self.ensure_rff();

        let pair = match &self.rff {
            RffState::Unused => None,
            RffState::Table(fields) => {
                if n < 0 || n >= fields.len() as i64 {
                    return Ok(None);
                }
                Some(fields[n as usize])
            }
            RffState::Uninitialized => unreachable!("rff table initialized above"),
        };

        let Some((top_src, bottom_src)) = pair else {
            return self.get_frame(n, false);
        };

        if top_src == bottom_src {
            return self.get_frame(top_src, false);
        }

        // Fetch the earlier source frame first so linear decoders move
        // forward, then merge the other field into a copy of it.
        if top_src < bottom_src {
            let top = self.get_frame(top_src, false)?;
            let bottom = self.get_frame(bottom_src, false)?;
            let (Some(top), Some(bottom)) = (top, bottom) else {
                return Ok(None);
            };
            let mut merged = (*top).clone();
            merged.merge_field(false, &bottom)?;
            Ok(Some(Arc::new(merged)))
        } else {
            let bottom = self.get_frame(bottom_src, false)?;
            let top = self.get_frame(top_src, false)?;
            let (Some(top), Some(bottom)) = (top, bottom) else {
                return Ok(None);
            };
            let mut merged = (*bottom).clone();
            merged.merge_field(true, &top)?;
            Ok(Some(Arc::new(merged)))
        }
    }

    fn get_frame_by_time(&mut self, seconds: f64) -> Result<Option<Arc<VideoFrame>>> {
        let target = target_pts_for_time(self.props.time_base, seconds);
        let n = frame_number_by_pts(&self.index.frames, target);
        self.get_frame(n, false)
    }

    fn get_frame_is_tff(&mut self, n: i64, rff: bool) -> bool {
        if n < 0
            || (!rff && n >= self.props.num_frames)
            || (rff && n >= self.props.num_rff_frames)
        {
            return false;
        }

        if rff {
            self.ensure_rff();
            if let RffState::Table(fields) = &self.rff {
                let (top_src, bottom_src) = fields[n as usize];
                return top_src < bottom_src;
            }
        }
        self.index.frames[n as usize].top_field_first
    }

    fn ensure_rff(&mut self) {
        if matches!(self.rff, RffState::Uninitialized) {
            self.rff = RffState::Table(build_field_table(
                &self.index.frames,
                self.props.num_rff_frames,
            ));
        }
    }
}
