//! FFmpeg decoder backend
//!
//! Wraps one demuxer + codec pair behind the [`Decoder`] trait. The safe
//! `ffmpeg-next` surface covers open, packet reading and frame decoding;
//! the raw `ffmpeg-sys-next` API fills the gaps the wrapper does not expose
//! (PTS seeking, frame flags, pixel format descriptors, parameter side data,
//! hardware device setup).
//!
//! # Safety
//!
//! The `unsafe` blocks only dereference pointers owned by the live `Input`
//! and decoder wrappers, and every FFmpeg return code is checked.

use std::ffi::CString;
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::Once;

use ffmpeg_next as ffmpeg;
use ffmpeg_sys_next as sys;

use ffmpeg::codec;
use ffmpeg::format;
use ffmpeg::media;
use ffmpeg::util::frame;
use tracing::{debug, warn};
use videoseek_common::{
    ColorFamily, ContentLightLevel, FrameFormat, HdrMetadata, MasteringDisplayLuminance,
    MasteringDisplayPrimaries, Rational, Result, SourceError, Stereo3DInfo, VideoProperties,
};

use crate::decoder::{decoder_thread_count, Decoder, DecoderOpener, FRAME_NUMBER_UNKNOWN};
use crate::frame::{ColorInfo, Plane, VideoFrame};
use crate::source::SourceOptions;

// AVFrame flag bits; defined locally so the build does not depend on which
// libavutil introduced them.
const AV_FRAME_FLAG_KEY: i32 = 1 << 1;
const AV_FRAME_FLAG_INTERLACED: i32 = 1 << 2;
const AV_FRAME_FLAG_TOP_FIELD_FIRST: i32 = 1 << 3;

fn init_ffmpeg() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("ffmpeg init failed: {e}");
        }
    });
}

/// Forward a log level to `av_log_set_level`. Call before constructing any
/// engine; the libav default applies otherwise.
pub fn set_ffmpeg_log_level(level: i32) {
    init_ffmpeg();
    unsafe { sys::av_log_set_level(level) };
}

/// Opens [`FfmpegDecoder`] handles for one source + option set.
pub struct FfmpegOpener {
    source: PathBuf,
    options: SourceOptions,
}

impl FfmpegOpener {
    #[must_use]
    pub fn new(source: PathBuf, options: SourceOptions) -> Self {
        Self { source, options }
    }
}

impl DecoderOpener for FfmpegOpener {
    fn open(&self) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(FfmpegDecoder::open(&self.source, &self.options)?))
    }
}

pub struct FfmpegDecoder {
    input: format::context::Input,
    decoder: codec::decoder::Video,
    track: usize,
    hw: bool,
    is_h264: bool,
    variable_format: bool,
    /// First delivered (format, width, height); later mismatches are dropped
    /// unless `variable_format` is set
    first_format: Option<(ffmpeg::format::Pixel, u32, u32)>,
    current_frame: i64,
    seeked: bool,
    decode_ok: bool,
}

impl FfmpegDecoder {
    pub fn open(source: &std::path::Path, options: &SourceOptions) -> Result<Self> {
        init_ffmpeg();

        let mut dict = ffmpeg::Dictionary::new();
        for (key, value) in &options.demuxer_options {
            dict.set(key, value);
        }

        let mut input = format::input_with_dictionary(&source, dict)
            .map_err(|e| SourceError::OpenFailed(format!("couldn't open '{}': {e}", source.display())))?;

        let track = resolve_track(&input, options.track)?;

        // Everything except the selected track is discarded at demux level.
        unsafe {
            let fmt = input.as_mut_ptr();
            for i in 0..(*fmt).nb_streams as usize {
                if i != track {
                    (**(*fmt).streams.add(i)).discard = sys::AVDiscard::AVDISCARD_ALL;
                }
            }
        }

        let hw_type = hw_device_type(&options.hw_device)?;
        let cuda = matches!(hw_type, Some(sys::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA));

        let stream = input
            .stream(track)
            .ok_or_else(|| SourceError::BadTrack("invalid track index".to_string()))?;
        let codec_id = stream.parameters().id();
        let is_h264 = codec_id == codec::Id::H264;

        let codec = if hw_type.is_some() && codec_id == codec::Id::AV1 {
            // The default AV1 decoder is software only.
            codec::decoder::find_by_name("av1")
        } else {
            codec::decoder::find(codec_id)
        }
        .ok_or_else(|| SourceError::OpenFailed("video codec not found".to_string()))?;

        let mut context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| SourceError::FFmpegError(format!("could not copy codec parameters: {e}")))?;

        let threads = decoder_thread_count(options.threads, cuda, is_h264);

        unsafe {
            let ctx = context.as_mut_ptr();
            (*ctx).thread_count = threads;

            // H.264 streams misreport their reorder depth when the first
            // packet carries broken SEI; force the worst case.
            if (*ctx).codec_id == sys::AVCodecID::AV_CODEC_ID_H264 && (*ctx).has_b_frames != 0 {
                (*ctx).has_b_frames = 15;
            }
        }

        if let Some(device_type) = hw_type {
            let pix_fmt = hw_config_pix_fmt(codec.as_ptr(), device_type)?;
            unsafe {
                let ctx = context.as_mut_ptr();
                (*ctx).extra_hw_frames = options.extra_hw_frames;
                (*ctx).pix_fmt = pix_fmt;

                let mut device: *mut sys::AVBufferRef = ptr::null_mut();
                if sys::av_hwdevice_ctx_create(
                    &mut device,
                    device_type,
                    ptr::null(),
                    ptr::null_mut(),
                    0,
                ) < 0
                {
                    return Err(SourceError::OpenFailed(
                        "failed to create specified HW device".to_string(),
                    ));
                }
                (*ctx).hw_device_ctx = device;
            }
        }

        let decoder = context
            .decoder()
            .open_as(codec)
            .map_err(|e| SourceError::OpenFailed(format!("could not open video codec: {e}")))?
            .video()
            .map_err(|e| SourceError::OpenFailed(format!("not a video decoder: {e}")))?;

        Ok(Self {
            input,
            decoder,
            track,
            hw: hw_type.is_some(),
            is_h264,
            variable_format: options.variable_format,
            first_format: None,
            current_frame: 0,
            seeked: false,
            decode_ok: true,
        })
    }

    /// Read demuxed packets until one belongs to the selected track.
    fn read_packet(&mut self) -> Option<ffmpeg::Packet> {
        let track = self.track;
        self.input
            .packets()
            .find(|(stream, _)| stream.index() == track)
            .map(|(_, packet)| packet)
    }

    /// Core receive loop: pull a frame, feeding packets on demand and EOF at
    /// stream end.
    fn receive_frame(&mut self) -> Option<frame::Video> {
        let mut decoded = frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => return Some(decoded),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    match self.read_packet() {
                        Some(packet) => {
                            let _ = self.decoder.send_packet(&packet);
                        }
                        None => {
                            let _ = self.decoder.send_eof();
                        }
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Decode the next frame of the track, dropping mid-stream format changes
    /// when variable formats are not allowed. With `skip` set the pixel data
    /// is not downloaded from hardware surfaces.
    fn decode_next(&mut self, skip: bool) -> Option<frame::Video> {
        loop {
            let decoded = self.receive_frame()?;

            if !self.variable_format {
                let signature = (decoded.format(), decoded.width(), decoded.height());
                match self.first_format {
                    None => self.first_format = Some(signature),
                    Some(first) if first != signature => {
                        debug!("dropping frame with mid-stream format change");
                        continue;
                    }
                    Some(_) => {}
                }
            }

            if self.hw && !skip {
                return self.download_hw_frame(&decoded);
            }
            return Some(decoded);
        }
    }

    fn download_hw_frame(&self, hw_frame: &frame::Video) -> Option<frame::Video> {
        let mut sw = frame::Video::empty();
        unsafe {
            if sys::av_hwframe_transfer_data(sw.as_mut_ptr(), hw_frame.as_ptr(), 0) < 0 {
                return None;
            }
            sys::av_frame_copy_props(sw.as_mut_ptr(), hw_frame.as_ptr());
        }
        Some(sw)
    }

    fn stream_ptr(&self) -> *const sys::AVStream {
        unsafe { *(*self.input.as_ptr()).streams.add(self.track) }
    }
}

impl Decoder for FfmpegDecoder {
    fn next_frame(&mut self) -> Option<VideoFrame> {
        if !self.decode_ok {
            return None;
        }
        match self.decode_next(false) {
            Some(raw) => {
                self.current_frame += 1;
                match convert_frame(&raw) {
                    Ok(converted) => Some(converted),
                    Err(e) => {
                        warn!("undecodable frame payload: {e}");
                        self.decode_ok = false;
                        None
                    }
                }
            }
            None => {
                self.decode_ok = false;
                None
            }
        }
    }

    fn skip_frames(&mut self, mut count: i64) -> bool {
        while count > 0 && self.decode_ok {
            if self.decode_next(true).is_some() {
                self.current_frame += 1;
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
        // The decoder must see the broken SEI of the first packet once before
        // any seek, or every position afterwards reports shifted timestamps.
        // Why is it always h264?
        if !self.seeked && self.is_h264 {
            self.skip_frames(1);
        }
        self.seeked = true;
        self.decoder.flush();
        self.current_frame = FRAME_NUMBER_UNKNOWN;
        self.decode_ok = unsafe {
            sys::av_seek_frame(
                self.input.as_mut_ptr(),
                self.track as i32,
                pts,
                sys::AVSEEK_FLAG_BACKWARD as i32,
            ) >= 0
        };
        self.decode_ok
    }

    fn has_seeked(&self) -> bool {
        self.seeked
    }

    fn frame_number(&self) -> i64 {
        self.current_frame
    }

    fn set_frame_number(&mut self, n: i64) {
        self.current_frame = n;
    }

    fn source_size(&self) -> i64 {
        unsafe { sys::avio_size((*self.input.as_ptr()).pb) }
    }

    fn source_position(&self) -> i64 {
        // avio_tell is a macro; this is its expansion (whence = SEEK_CUR).
        unsafe { sys::avio_seek((*self.input.as_ptr()).pb, 0, 1) }
    }

    fn track(&self) -> i32 {
        self.track as i32
    }

    fn read_properties(&mut self) -> Result<VideoProperties> {
        debug_assert_eq!(self.current_frame, 0);
        // Codec context values are unreliable until the first frame decodes.
        let first = self.decode_next(false).ok_or_else(|| {
            self.decode_ok = false;
            SourceError::DecodeError("no frame could be decoded".to_string())
        })?;
        self.current_frame += 1;

        let format = frame_format(&first)?;

        let mut fps = self.decoder.frame_rate().unwrap_or(ffmpeg::Rational(0, 1));
        let stream = unsafe { &*self.stream_ptr() };
        if fps.numerator() <= 0 || fps.denominator() <= 0 {
            fps = ffmpeg::Rational(stream.r_frame_rate.num, stream.r_frame_rate.den);
        }
        if fps.numerator() <= 0 || fps.denominator() <= 0 {
            fps = ffmpeg::Rational(30, 1);
        }

        let mut sar = self.decoder.aspect_ratio();
        if sar.numerator() <= 0 || sar.denominator() <= 0 {
            sar = ffmpeg::Rational(stream.sample_aspect_ratio.num, stream.sample_aspect_ratio.den);
        }

        let time_base = Rational::new(stream.time_base.num, stream.time_base.den);

        let duration = stream.duration;
        let mut num_frames = stream.nb_frames;
        if num_frames <= 0 && duration > 0 && fps.numerator() > 0 {
            num_frames = duration * i64::from(fps.numerator()) / i64::from(fps.denominator());
        }
        if num_frames <= 0 {
            num_frames = -1;
        }

        let start_time = first
            .pts()
            .map(|pts| f64::from(time_base.num) * pts as f64 / f64::from(time_base.den))
            .unwrap_or(0.0);

        let (stereo3d, hdr, rotation) = stream_side_data(stream);
        let (rotation, flip_horizontal, flip_vertical) = rotation;

        Ok(VideoProperties {
            width: self.decoder.width() as i32,
            height: self.decoder.height() as i32,
            format,
            fps: Rational::new(fps.numerator(), fps.denominator()),
            sar: Rational::new(sar.numerator(), sar.denominator()),
            time_base: millisecond_time_base(time_base),
            num_frames,
            num_rff_frames: num_frames,
            duration,
            start_time,
            rotation,
            flip_horizontal,
            flip_vertical,
            stereo3d,
            hdr,
        })
    }
}

/// Resolve a possibly negative track request: `-n` means the n-th video
/// stream in file order, absolute indices are used as-is.
fn resolve_track(input: &format::context::Input, requested: i32) -> Result<usize> {
    let mut track = requested;
    if track < 0 {
        for (i, stream) in input.streams().enumerate() {
            if stream.parameters().medium() == media::Type::Video {
                if track == -1 {
                    track = i as i32;
                    break;
                }
                track += 1;
            }
        }
    }

    let nb_streams = input.streams().count() as i32;
    if track < 0 || track >= nb_streams {
        return Err(SourceError::BadTrack("invalid track index".to_string()));
    }
    let stream = input
        .stream(track as usize)
        .ok_or_else(|| SourceError::BadTrack("invalid track index".to_string()))?;
    if stream.parameters().medium() != media::Type::Video {
        return Err(SourceError::BadTrack("not a video track".to_string()));
    }
    Ok(track as usize)
}

fn hw_device_type(name: &str) -> Result<Option<sys::AVHWDeviceType>> {
    if name.is_empty() {
        return Ok(None);
    }
    let cname = CString::new(name)
        .map_err(|_| SourceError::OpenFailed(format!("unknown HW device: {name}")))?;
    let device_type = unsafe { sys::av_hwdevice_find_type_by_name(cname.as_ptr()) };
    if device_type == sys::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
        return Err(SourceError::OpenFailed(format!("unknown HW device: {name}")));
    }
    Ok(Some(device_type))
}

fn hw_config_pix_fmt(
    codec: *const sys::AVCodec,
    device_type: sys::AVHWDeviceType,
) -> Result<sys::AVPixelFormat> {
    for i in 0.. {
        let config = unsafe { sys::avcodec_get_hw_config(codec, i) };
        if config.is_null() {
            break;
        }
        let config = unsafe { &*config };
        if config.methods as u32 & sys::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32 != 0
            && config.device_type == device_type
        {
            return Ok(config.pix_fmt);
        }
    }
    Err(SourceError::OpenFailed(
        "decoder does not support the requested device type".to_string(),
    ))
}

/// Scale a stream time base so `pts * num / den` yields milliseconds.
fn millisecond_time_base(time_base: Rational) -> Rational {
    fn gcd(a: i64, b: i64) -> i64 {
        if b == 0 {
            a.abs()
        } else {
            gcd(b, a % b)
        }
    }
    let num = i64::from(time_base.num) * 1000;
    let den = i64::from(time_base.den);
    let g = gcd(num, den).max(1);
    Rational::new((num / g) as i32, (den / g) as i32)
}

/// Build the [`FrameFormat`] for a decoded frame, rejecting formats the
/// output contract cannot express.
fn frame_format(raw: &frame::Video) -> Result<FrameFormat> {
    let pix_fmt: sys::AVPixelFormat = raw.format().into();
    let desc = unsafe { sys::av_pix_fmt_desc_get(pix_fmt) };
    if desc.is_null() {
        return Err(SourceError::UnsupportedFormat(
            "unknown pixel format".to_string(),
        ));
    }
    let desc = unsafe { &*desc };

    let flags = desc.flags;
    if flags & sys::AV_PIX_FMT_FLAG_PAL as u64 != 0
        || flags & sys::AV_PIX_FMT_FLAG_BITSTREAM as u64 != 0
    {
        return Err(SourceError::UnsupportedFormat(format!(
            "palette or bitstream pixel format {:?}",
            raw.format()
        )));
    }

    let bits = desc.comp[0].depth;
    let bytes_per_sample = match bits {
        1..=8 => 1,
        9..=16 => 2,
        17..=32 => 4,
        33..=64 => 8,
        _ => {
            return Err(SourceError::UnsupportedFormat(format!(
                "unsupported bit depth {bits}"
            )))
        }
    };
    if bits < 8 {
        return Err(SourceError::UnsupportedFormat(format!(
            "sub-8-bit pixel format {:?}",
            raw.format()
        )));
    }

    let color_family = if desc.nb_components <= 2 {
        ColorFamily::Gray
    } else if flags & sys::AV_PIX_FMT_FLAG_RGB as u64 != 0 {
        ColorFamily::Rgb
    } else {
        ColorFamily::Yuv
    };

    Ok(FrameFormat {
        color_family,
        bits,
        bytes_per_sample,
        alpha: flags & sys::AV_PIX_FMT_FLAG_ALPHA as u64 != 0,
        float_samples: flags & sys::AV_PIX_FMT_FLAG_FLOAT as u64 != 0,
        sub_sampling_w: i32::from(desc.log2_chroma_w),
        sub_sampling_h: i32::from(desc.log2_chroma_h),
    })
}

/// Copy an AVFrame into an owned [`VideoFrame`], stripping linesize padding.
fn convert_frame(raw: &frame::Video) -> Result<VideoFrame> {
    let format = frame_format(raw)?;

    let pix_fmt: sys::AVPixelFormat = raw.format().into();
    let desc = unsafe { &*sys::av_pix_fmt_desc_get(pix_fmt) };

    // True plane census: per-plane sample size is the widest component step
    // mapped onto that plane, which also covers semi-planar layouts.
    let mut sample_size = [0usize; 4];
    let mut num_planes = 0usize;
    for c in 0..desc.nb_components as usize {
        let comp = desc.comp[c];
        let plane = comp.plane as usize;
        sample_size[plane] = sample_size[plane].max(comp.step as usize);
        num_planes = num_planes.max(plane + 1);
    }

    let ptr = raw.as_ptr();
    let width = unsafe { (*ptr).width } as usize;
    let height = unsafe { (*ptr).height } as usize;

    let mut planes = Vec::with_capacity(num_planes);
    for p in 0..num_planes {
        let (mut w, mut h) = (width, height);
        if p == 1 || p == 2 {
            w >>= desc.log2_chroma_w;
            h >>= desc.log2_chroma_h;
        }
        let row_bytes = w * sample_size[p];
        let mut plane = Plane::new(row_bytes, h);
        unsafe {
            let linesize = (*ptr).linesize[p];
            if linesize < row_bytes as i32 {
                return Err(SourceError::DecodeError(
                    "frame linesize smaller than visible row".to_string(),
                ));
            }
            let src = (*ptr).data[p];
            for r in 0..h {
                let row = slice::from_raw_parts(src.add(r * linesize as usize), row_bytes);
                plane.data[r * row_bytes..(r + 1) * row_bytes].copy_from_slice(row);
            }
        }
        planes.push(plane);
    }

    let (flags, repeat_pict, pict_type, color) = unsafe {
        (
            (*ptr).flags,
            (*ptr).repeat_pict,
            picture_type_char((*ptr).pict_type),
            ColorInfo {
                matrix: (*ptr).colorspace as i32,
                primaries: (*ptr).color_primaries as i32,
                transfer: (*ptr).color_trc as i32,
                range: (*ptr).color_range as i32,
                chroma_location: (*ptr).chroma_location as i32,
            },
        )
    };

    let (hdr, dovi_rpu, hdr10_plus) = frame_side_data(raw);

    Ok(VideoFrame {
        format,
        width: width as i32,
        height: height as i32,
        planes,
        pts: raw.pts().unwrap_or(videoseek_common::PTS_NONE),
        duration: unsafe { (*ptr).duration },
        repeat_pict,
        key_frame: flags & AV_FRAME_FLAG_KEY != 0,
        top_field_first: flags & AV_FRAME_FLAG_TOP_FIELD_FIRST != 0,
        interlaced: flags & AV_FRAME_FLAG_INTERLACED != 0,
        pict_type,
        color,
        hdr,
        dovi_rpu,
        hdr10_plus,
    })
}

fn picture_type_char(pict_type: sys::AVPictureType) -> char {
    use sys::AVPictureType::*;
    match pict_type {
        AV_PICTURE_TYPE_I => 'I',
        AV_PICTURE_TYPE_P => 'P',
        AV_PICTURE_TYPE_B => 'B',
        AV_PICTURE_TYPE_S => 'S',
        AV_PICTURE_TYPE_SI => 'i',
        AV_PICTURE_TYPE_SP => 'p',
        AV_PICTURE_TYPE_BI => 'b',
        _ => '?',
    }
}

/// Per-frame side data: static HDR metadata plus owned copies of the dynamic
/// metadata payloads.
fn frame_side_data(raw: &frame::Video) -> (HdrMetadata, Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut hdr = HdrMetadata::default();

    if let Some(bytes) = raw_frame_side_data(
        raw,
        sys::AVFrameSideDataType::AV_FRAME_DATA_MASTERING_DISPLAY_METADATA,
    ) {
        if bytes.len() >= std::mem::size_of::<sys::AVMasteringDisplayMetadata>() {
            let md = unsafe { &*bytes.as_ptr().cast::<sys::AVMasteringDisplayMetadata>() };
            let (primaries, luminance) = mastering_display(md);
            hdr.mastering_primaries = primaries;
            hdr.mastering_luminance = luminance;
        }
    }

    if let Some(bytes) = raw_frame_side_data(
        raw,
        sys::AVFrameSideDataType::AV_FRAME_DATA_CONTENT_LIGHT_LEVEL,
    ) {
        if bytes.len() >= std::mem::size_of::<sys::AVContentLightMetadata>() {
            let cll = unsafe { &*bytes.as_ptr().cast::<sys::AVContentLightMetadata>() };
            hdr.content_light = content_light(cll);
        }
    }

    let dovi_rpu = raw_frame_side_data(raw, sys::AVFrameSideDataType::AV_FRAME_DATA_DOVI_RPU_BUFFER)
        .map(<[u8]>::to_vec);
    let hdr10_plus = raw_frame_side_data(raw, sys::AVFrameSideDataType::AV_FRAME_DATA_DYNAMIC_HDR_PLUS)
        .map(<[u8]>::to_vec);

    (hdr, dovi_rpu, hdr10_plus)
}

fn raw_frame_side_data(
    raw: &frame::Video,
    kind: sys::AVFrameSideDataType,
) -> Option<&[u8]> {
    unsafe {
        let sd = sys::av_frame_get_side_data(raw.as_ptr(), kind);
        if sd.is_null() {
            return None;
        }
        Some(slice::from_raw_parts((*sd).data, (*sd).size))
    }
}

fn mastering_display(
    md: &sys::AVMasteringDisplayMetadata,
) -> (
    Option<MasteringDisplayPrimaries>,
    Option<MasteringDisplayLuminance>,
) {
    let conv = |r: sys::AVRational| Rational::new(r.num, r.den);

    let mut primaries = None;
    if md.has_primaries != 0 {
        let p = MasteringDisplayPrimaries {
            primaries: [
                [conv(md.display_primaries[0][0]), conv(md.display_primaries[0][1])],
                [conv(md.display_primaries[1][0]), conv(md.display_primaries[1][1])],
                [conv(md.display_primaries[2][0]), conv(md.display_primaries[2][1])],
            ],
            white_point: [conv(md.white_point[0]), conv(md.white_point[1])],
        };
        let complete = p
            .primaries
            .iter()
            .flatten()
            .chain(p.white_point.iter())
            .all(|r| r.num != 0);
        if complete {
            primaries = Some(p);
        }
    }

    // The minimum may legitimately be zero; only the maximum gates validity.
    let mut luminance = None;
    if md.has_luminance != 0 && md.max_luminance.num != 0 {
        luminance = Some(MasteringDisplayLuminance {
            min: conv(md.min_luminance),
            max: conv(md.max_luminance),
        });
    }

    (primaries, luminance)
}

fn content_light(cll: &sys::AVContentLightMetadata) -> Option<ContentLightLevel> {
    if cll.MaxCLL == 0 && cll.MaxFALL == 0 {
        return None;
    }
    Some(ContentLightLevel {
        max_cll: cll.MaxCLL,
        max_fall: cll.MaxFALL,
    })
}

/// Stream-level side data, read once at open: stereo 3D packing, static HDR
/// metadata and the display matrix.
fn stream_side_data(stream: &sys::AVStream) -> (Stereo3DInfo, HdrMetadata, (i32, bool, bool)) {
    let mut stereo = Stereo3DInfo::default();
    let mut hdr = HdrMetadata::default();
    let mut rotation = (0, false, false);

    let par = stream.codecpar;
    if par.is_null() {
        return (stereo, hdr, rotation);
    }

    unsafe fn get(
        par: *const sys::AVCodecParameters,
        kind: sys::AVPacketSideDataType,
    ) -> Option<&'static [u8]> {
        let sd = sys::av_packet_side_data_get(
            (*par).coded_side_data,
            (*par).nb_coded_side_data,
            kind,
        );
        if sd.is_null() {
            None
        } else {
            Some(slice::from_raw_parts((*sd).data, (*sd).size))
        }
    }

    unsafe {
        if let Some(bytes) = get(par, sys::AVPacketSideDataType::AV_PKT_DATA_STEREO3D) {
            if bytes.len() >= std::mem::size_of::<sys::AVStereo3D>() {
                let s3d = &*bytes.as_ptr().cast::<sys::AVStereo3D>();
                stereo = Stereo3DInfo {
                    kind: s3d.type_ as i32,
                    flags: s3d.flags as u32,
                };
            }
        }

        if let Some(bytes) = get(par, sys::AVPacketSideDataType::AV_PKT_DATA_MASTERING_DISPLAY_METADATA) {
            if bytes.len() >= std::mem::size_of::<sys::AVMasteringDisplayMetadata>() {
                let md = &*bytes.as_ptr().cast::<sys::AVMasteringDisplayMetadata>();
                let (primaries, luminance) = mastering_display(md);
                hdr.mastering_primaries = primaries;
                hdr.mastering_luminance = luminance;
            }
        }

        if let Some(bytes) = get(par, sys::AVPacketSideDataType::AV_PKT_DATA_CONTENT_LIGHT_LEVEL) {
            if bytes.len() >= std::mem::size_of::<sys::AVContentLightMetadata>() {
                let cll = &*bytes.as_ptr().cast::<sys::AVContentLightMetadata>();
                hdr.content_light = content_light(cll);
            }
        }

        if let Some(bytes) = get(par, sys::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX) {
            if bytes.len() >= 36 {
                let mut matrix = [0i32; 9];
                for (i, chunk) in bytes[..36].chunks_exact(4).enumerate() {
                    matrix[i] = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                rotation = rotation_from_display_matrix(matrix);
            }
        }
    }

    (stereo, hdr, rotation)
}

/// Normalize a display matrix into `(rotation, flip_horizontal,
/// flip_vertical)` with rotation in counter-clockwise degrees `[0, 360)` and
/// the flips decoupled from it.
fn rotation_from_display_matrix(mut matrix: [i32; 9]) -> (i32, bool, bool) {
    let det = i64::from(matrix[0]) * i64::from(matrix[4])
        - i64::from(matrix[1]) * i64::from(matrix[3]);

    let mut flip_horizontal = false;
    let mut flip_vertical = false;
    if det < 0 {
        // Assume a horizontal flip and un-flip the matrix so rotation can be
        // read off it independently.
        flip_horizontal = true;
        for i in [0, 3, 6] {
            matrix[i] = -matrix[i];
        }
    }

    let Some(angle) = display_rotation(&matrix) else {
        return (0, flip_horizontal, flip_vertical);
    };
    let mut rot = angle.round() as i32;

    if rot == 180 && det < 0 {
        // A plain vertical flip, no rotation.
        flip_horizontal = false;
        flip_vertical = true;
        rot = 0;
    } else if flip_horizontal || flip_vertical {
        // With a flip present the angle applies to the video frame rather
        // than the rendering frame.
        rot = -rot;
    }

    (((-rot) % 360 + 360) % 360, flip_horizontal, flip_vertical)
}

/// Rotation angle encoded in a display matrix, degrees in `(-180, 180]`;
/// `None` for degenerate matrices.
fn display_rotation(matrix: &[i32; 9]) -> Option<f64> {
    let conv = |x: i32| f64::from(x) / 65536.0;
    let scale0 = conv(matrix[0]).hypot(conv(matrix[3]));
    let scale1 = conv(matrix[1]).hypot(conv(matrix[4]));
    if scale0 == 0.0 || scale1 == 0.0 {
        return None;
    }
    let rotation = (conv(matrix[1]) / scale1)
        .atan2(conv(matrix[0]) / scale0)
        .to_degrees();
    Some(-rotation)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: i32 = 1 << 16;

    fn rotation_matrix(degrees: f64) -> [i32; 9] {
        let (sin, cos) = degrees.to_radians().sin_cos();
        [
            (cos * f64::from(ONE)).round() as i32,
            (-sin * f64::from(ONE)).round() as i32,
            0,
            (sin * f64::from(ONE)).round() as i32,
            (cos * f64::from(ONE)).round() as i32,
            0,
            0,
            0,
            1 << 30,
        ]
    }

    #[test]
    fn identity_matrix_has_no_rotation() {
        assert_eq!(
            rotation_from_display_matrix(rotation_matrix(0.0)),
            (0, false, false)
        );
    }

    #[test]
    fn quarter_turns_normalize_counter_clockwise() {
        assert_eq!(
            rotation_from_display_matrix(rotation_matrix(90.0)),
            (270, false, false)
        );
        assert_eq!(
            rotation_from_display_matrix(rotation_matrix(-90.0)),
            (90, false, false)
        );
        assert_eq!(
            rotation_from_display_matrix(rotation_matrix(180.0)),
            (180, false, false)
        );
    }

    #[test]
    fn horizontal_flip_is_decoupled() {
        let mut matrix = rotation_matrix(0.0);
        matrix[0] = -matrix[0];
        assert_eq!(rotation_from_display_matrix(matrix), (0, true, false));
    }

    #[test]
    fn vertical_flip_reports_mirrored_rotation() {
        // scale(1, -1): detected as horizontal flip + 180 degree rotation,
        // which displays identically.
        let mut matrix = rotation_matrix(0.0);
        matrix[4] = -matrix[4];
        assert_eq!(rotation_from_display_matrix(matrix), (180, true, false));
    }

    #[test]
    fn degenerate_matrix_is_ignored() {
        assert_eq!(rotation_from_display_matrix([0; 9]), (0, false, false));
    }

    #[test]
    fn millisecond_time_base_scaling() {
        // Matroska 1/1000: one tick is already a millisecond.
        assert_eq!(
            millisecond_time_base(Rational::new(1, 1000)),
            Rational::new(1, 1)
        );
        // MP4 1/90000.
        assert_eq!(
            millisecond_time_base(Rational::new(1, 90000)),
            Rational::new(1, 90)
        );
        assert_eq!(
            millisecond_time_base(Rational::new(1001, 30000)),
            Rational::new(1001, 30)
        );
    }
}
