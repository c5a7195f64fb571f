//! FFmpeg-backed runtime (cargo feature `ffmpeg`)
//!
//! Sources are read through a demuxer over a file, pipe or `tcp://` stream.
//! Decoded video travels as tightly packed `yuv420p`/`nv12` planes and decoded
//! audio as interleaved `flt`, which is what the filter and mix stages expect.

use super::{CaptureSource, CodecRuntime, ContainerSink, Decoder, Encoder, FrameFilter};
use crate::config::{AudioConfig, OutputConfig, SourceSpec, VideoConfig};
use crate::error::CodecError;
use crate::pipeline::types::{Frame, FrameFormat, MediaKind, Packet, SourceKind, StreamParams, TimeBase};
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioDecoder, AudioEncoder, AudioFrame, AudioFrameMut, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::video::frame::{get_pixel_format, PictureType};
use ac_ffmpeg::codec::video::{VideoDecoder, VideoEncoder, VideoFrame, VideoFrameMut, VideoFrameScaler};
use ac_ffmpeg::codec::{
    AudioCodecParameters, CodecParameters, Decoder as _, Encoder as _, VideoCodecParameters,
};
use ac_ffmpeg::format::demuxer::{Demuxer, DemuxerWithStreamInfo, InputFormat};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase as AvTimeBase, Timestamp};
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::net::TcpStream;

/// Encoder fallback chain: hardware encoders first, then software.
const VIDEO_ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "vbr"),
            ("delay", "0"),
            ("forced-idr", "1"),
        ],
    ),
    (
        "h264_qsv",
        &[("preset", "fast"), ("low_power", "0"), ("async_depth", "4")],
    ),
    (
        "h264_amf",
        &[
            ("usage", "lowlatency"),
            ("quality", "balanced"),
            ("rc", "vbr_peak"),
            ("frame_skipping", "0"),
        ],
    ),
    (
        "libx264",
        &[
            ("profile", "main"),
            ("preset", "fast"),
            ("tune", "zerolatency"),
            ("crf", "21"),
            ("bframes", "0"),
        ],
    ),
];

const AUDIO_ENCODER_CHAIN: &[&str] = &["aac", "libopus"];

/// Layout every decoded video frame is converted to
const DECODED_PIXEL_FORMAT: &str = "yuv420p";
/// Layout every decoded audio frame is converted to
const DECODED_SAMPLE_FORMAT: &str = "flt";

fn av_time_base(tb: TimeBase) -> AvTimeBase {
    AvTimeBase::new(tb.num, tb.den)
}

fn time_base_of(tb: AvTimeBase) -> TimeBase {
    TimeBase::new(tb.num(), tb.den())
}

fn timestamp_of(ts: Timestamp) -> Option<i64> {
    (!ts.is_null()).then(|| ts.timestamp())
}

fn channel_layout(channels: u16) -> Result<ChannelLayout, CodecError> {
    ChannelLayout::from_channels(channels as u32)
        .ok_or_else(|| CodecError::fatal(format!("no channel layout for {} channels", channels)))
}

/// `(row bytes, rows)` of each plane of a packed frame
fn plane_geometry(pixel_format: &str, width: usize, height: usize) -> Option<Vec<(usize, usize)>> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    match pixel_format {
        "yuv420p" => Some(vec![(width, height), (cw, ch), (cw, ch)]),
        "nv12" => Some(vec![(width, height), (cw * 2, ch)]),
        _ => None,
    }
}

fn unsupported_layout(pixel_format: &str) -> CodecError {
    CodecError::fatal(format!("pixel format {} cannot be packed", pixel_format))
}

/// Copy `rows` rows of `width` bytes between buffers of different strides
#[inline]
fn copy_plane(dst: &mut [u8], dst_stride: usize, src: &[u8], src_stride: usize, width: usize, rows: usize) {
    if dst_stride == src_stride && src.len() >= rows * src_stride && dst.len() >= rows * dst_stride {
        dst[..rows * dst_stride].copy_from_slice(&src[..rows * src_stride]);
        return;
    }
    for r in 0..rows {
        let (s, d) = (r * src_stride, r * dst_stride);
        if s + width > src.len() || d + width > dst.len() {
            break;
        }
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
    }
}

fn pack_video(frame: &VideoFrame, pixel_format: &str) -> Result<Frame, CodecError> {
    let (width, height) = (frame.width(), frame.height());
    let geometry = plane_geometry(pixel_format, width, height).ok_or_else(|| unsupported_layout(pixel_format))?;
    let total = geometry.iter().map(|(w, h)| w * h).sum();
    let mut packed = vec![0u8; total];

    let planes = frame.planes();
    let mut offset = 0;
    for (index, (row, rows)) in geometry.into_iter().enumerate() {
        let plane = &planes[index];
        copy_plane(&mut packed[offset..offset + row * rows], row, plane.data(), plane.line_size(), row, rows);
        offset += row * rows;
    }

    let mut out = Frame::video(width as u32, height as u32, pixel_format, Bytes::from(packed));
    out.time_base = time_base_of(frame.time_base());
    out.pts = timestamp_of(frame.pts());
    Ok(out)
}

fn unpack_video(frame: &Frame) -> Result<VideoFrameMut, CodecError> {
    let FrameFormat::Video {
        width,
        height,
        pixel_format,
    } = &frame.format
    else {
        return Err(CodecError::fatal("audio frame fed to a video filter"));
    };
    let (width, height) = (*width as usize, *height as usize);
    let geometry = plane_geometry(pixel_format, width, height).ok_or_else(|| unsupported_layout(pixel_format))?;

    let mut out = VideoFrameMut::black(get_pixel_format(pixel_format), width, height)
        .with_time_base(av_time_base(frame.time_base));
    if let Some(pts) = frame.pts {
        out = out.with_pts(Timestamp::new(pts, av_time_base(frame.time_base)));
    }
    {
        let mut planes = out.planes_mut();
        let mut offset = 0;
        for (index, (row, rows)) in geometry.into_iter().enumerate() {
            let src = frame.data.get(offset..offset + row * rows).unwrap_or(&[]);
            let plane = &mut planes[index];
            let stride = plane.line_size();
            copy_plane(plane.data_mut(), stride, src, row, row, rows);
            offset += row * rows;
        }
    }
    Ok(out)
}

fn pack_audio(frame: &AudioFrame) -> Frame {
    let channels = frame.channel_layout().channels() as u16;
    let len = frame.samples() * channels as usize * std::mem::size_of::<f32>();
    let data = frame.planes()[0].data();
    let mut out = Frame::audio(
        frame.sample_rate(),
        channels,
        DECODED_SAMPLE_FORMAT,
        frame.samples(),
        Bytes::copy_from_slice(&data[..len.min(data.len())]),
    );
    out.time_base = time_base_of(frame.time_base());
    out.pts = timestamp_of(frame.pts());
    out
}

fn unpack_audio(frame: &Frame) -> Result<AudioFrameMut, CodecError> {
    let FrameFormat::Audio {
        sample_rate,
        channels,
        sample_format,
    } = &frame.format
    else {
        return Err(CodecError::fatal("video frame fed to an audio filter"));
    };
    let layout = channel_layout(*channels)?;
    let mut out = AudioFrameMut::silence(
        &layout,
        get_sample_format(sample_format),
        *sample_rate,
        frame.nb_samples,
    )
    .with_time_base(av_time_base(frame.time_base));
    if let Some(pts) = frame.pts {
        out = out.with_pts(Timestamp::new(pts, av_time_base(frame.time_base)));
    }
    {
        let mut planes = out.planes_mut();
        let data = planes[0].data_mut();
        let len = data.len().min(frame.data.len());
        data[..len].copy_from_slice(&frame.data[..len]);
    }
    Ok(out)
}

fn packet_of(packet: &ac_ffmpeg::packet::Packet, kind: MediaKind) -> Packet {
    let time_base = time_base_of(packet.time_base());
    let mut out = Packet::new(
        kind,
        Bytes::copy_from_slice(packet.data()),
        timestamp_of(packet.pts()),
        time_base,
    )
    .with_keyframe(packet.is_key());
    out.dts = timestamp_of(packet.dts());
    out
}

fn av_packet(packet: &Packet) -> ac_ffmpeg::packet::Packet {
    let tb = av_time_base(packet.time_base);
    let mut out = PacketMut::from(&packet.data[..])
        .with_time_base(tb)
        .with_stream_index(packet.stream_index)
        .with_key(packet.keyframe);
    if let Some(pts) = packet.pts {
        out = out.with_pts(Timestamp::new(pts, tb));
    }
    if let Some(dts) = packet.dts {
        out = out.with_dts(Timestamp::new(dts, tb));
    }
    out.freeze()
}

#[derive(Debug, Default)]
pub struct FfmpegRuntime;

impl FfmpegRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl CodecRuntime for FfmpegRuntime {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_source(&self, kind: SourceKind, spec: &SourceSpec) -> Result<Box<dyn CaptureSource>, CodecError> {
        info!("Ffmpeg: opening {} from {} ({})", kind, spec.url, spec.format);
        if let Some(address) = spec.url.strip_prefix("tcp://") {
            let stream = TcpStream::connect(address).map_err(CodecError::fatal)?;
            let demuxer = open_demuxer(IO::from_read_stream(stream), spec)?;
            return Ok(Box::new(FfmpegSource::new(kind, demuxer)?));
        }
        let file = File::open(&spec.url).map_err(CodecError::fatal)?;
        let demuxer = open_demuxer(IO::from_seekable_read_stream(file), spec)?;
        Ok(Box::new(FfmpegSource::new(kind, demuxer)?))
    }

    fn open_decoder(&self, params: &StreamParams) -> Result<Box<dyn Decoder>, CodecError> {
        Ok(match params.kind {
            MediaKind::Video => Box::new(FfmpegVideoDecoder::new(params)?),
            MediaKind::Audio => Box::new(FfmpegAudioDecoder::new(params)?),
        })
    }

    fn open_video_filter(&self, config: &VideoConfig) -> Result<Box<dyn FrameFilter>, CodecError> {
        if plane_geometry(&config.pixel_format, 2, 2).is_none() {
            return Err(unsupported_layout(&config.pixel_format));
        }
        Ok(Box::new(FfmpegScaler {
            width: config.width as usize,
            height: config.height as usize,
            pixel_format: config.pixel_format.clone(),
            scaler: None,
            pending: None,
        }))
    }

    fn open_audio_filter(&self, config: &AudioConfig) -> Result<Box<dyn FrameFilter>, CodecError> {
        Ok(Box::new(FfmpegResampler {
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_samples: config.frame_samples,
            resampler: None,
        }))
    }

    fn open_encoder(
        &self,
        kind: MediaKind,
        input: &Frame,
        time_base: TimeBase,
        video: &VideoConfig,
        audio: &AudioConfig,
    ) -> Result<Box<dyn Encoder>, CodecError> {
        match (&input.format, kind) {
            (FrameFormat::Video { width, height, pixel_format }, MediaKind::Video) => Ok(Box::new(
                FfmpegVideoEncoder::new(*width, *height, pixel_format, time_base, video)?,
            )),
            (FrameFormat::Audio { sample_rate, channels, .. }, MediaKind::Audio) => Ok(Box::new(
                FfmpegAudioEncoder::new(*sample_rate, *channels, time_base, audio)?,
            )),
            _ => Err(CodecError::fatal(format!(
                "{} encoder fed a {} frame",
                kind,
                input.kind()
            ))),
        }
    }

    fn open_sink(&self, output: &OutputConfig) -> Result<Box<dyn ContainerSink>, CodecError> {
        Ok(Box::new(FfmpegSink {
            output: output.clone(),
            streams: Vec::new(),
            muxer: None,
        }))
    }
}

fn open_demuxer<T: Read>(io: IO<T>, spec: &SourceSpec) -> Result<DemuxerWithStreamInfo<T>, CodecError> {
    let mut builder = Demuxer::builder();
    if !spec.format.is_empty() {
        let format = InputFormat::find_input_format(&spec.format)
            .ok_or_else(|| CodecError::fatal(format!("unknown input format {}", spec.format)))?;
        builder = builder.input_format(Some(format));
    }
    for (key, value) in &spec.options {
        builder = builder.set_option(key, value);
    }
    let demuxer = builder.build(io)?;
    demuxer.find_stream_info(None).map_err(|(_, e)| CodecError::from(e))
}

/// First stream of the source's media, read through a demuxer
pub struct FfmpegSource<T> {
    kind: SourceKind,
    demuxer: DemuxerWithStreamInfo<T>,
    stream_index: usize,
    params: StreamParams,
}

unsafe impl<T: Send> Send for FfmpegSource<T> {}

impl<T: Read> FfmpegSource<T> {
    fn new(kind: SourceKind, demuxer: DemuxerWithStreamInfo<T>) -> Result<Self, CodecError> {
        let media = kind.media();
        let found = demuxer.streams().iter().enumerate().find_map(|(index, stream)| {
            let codec = stream.codec_parameters();
            let tb = time_base_of(stream.time_base());
            let decoder = codec.decoder_name()?;
            let mut params = match media {
                MediaKind::Video => {
                    let video = codec.as_video_codec_parameters()?;
                    let mut params = StreamParams::video(decoder, video.width() as u32, video.height() as u32, tb);
                    params.pixel_format = video.pixel_format().name().to_string();
                    params
                }
                MediaKind::Audio => {
                    let audio = codec.as_audio_codec_parameters()?;
                    let mut params = StreamParams::audio(
                        decoder,
                        audio.sample_rate(),
                        audio.channel_layout().channels() as u16,
                        tb,
                    );
                    params.sample_format = audio.sample_format().name().to_string();
                    params
                }
            };
            params.extradata = codec.extradata().map(Bytes::copy_from_slice).unwrap_or_default();
            Some((index, params))
        });
        let (stream_index, params) =
            found.ok_or_else(|| CodecError::fatal(format!("{} source has no {} stream", kind, media)))?;
        debug!("Ffmpeg: {} uses stream #{} ({})", kind, stream_index, params.codec);
        Ok(Self {
            kind,
            demuxer,
            stream_index,
            params,
        })
    }
}

impl<T: Read> CaptureSource for FfmpegSource<T> {
    fn stream_params(&self) -> StreamParams {
        self.params.clone()
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        loop {
            match self.demuxer.take()? {
                Some(packet) if packet.stream_index() == self.stream_index => {
                    return Ok(packet_of(&packet, self.kind.media()));
                }
                Some(_) => continue,
                None => return Err(CodecError::Eof),
            }
        }
    }
}

/// Decodes video and converts it to packed `yuv420p`
pub struct FfmpegVideoDecoder {
    decoder: VideoDecoder,
    scaler: Option<VideoFrameScaler>,
    flushed: bool,
}

unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn new(params: &StreamParams) -> Result<Self, CodecError> {
        let decoder = VideoDecoder::builder(&params.codec)?
            .time_base(av_time_base(params.time_base))
            .extradata((!params.extradata.is_empty()).then(|| params.extradata.to_vec()))
            .build()?;
        Ok(Self {
            decoder,
            scaler: None,
            flushed: false,
        })
    }

    fn convert(&mut self, frame: VideoFrame) -> Result<Frame, CodecError> {
        if frame.pixel_format() == get_pixel_format(DECODED_PIXEL_FORMAT) {
            return pack_video(&frame, DECODED_PIXEL_FORMAT);
        }
        let scaler = match self.scaler.as_mut() {
            Some(scaler) => scaler,
            None => self.scaler.insert(
                VideoFrameScaler::builder()
                    .source_pixel_format(frame.pixel_format())
                    .source_width(frame.width())
                    .source_height(frame.height())
                    .target_pixel_format(get_pixel_format(DECODED_PIXEL_FORMAT))
                    .target_width(frame.width())
                    .target_height(frame.height())
                    .build()?,
            ),
        };
        let converted = scaler.scale(&frame)?;
        pack_video(&converted, DECODED_PIXEL_FORMAT)
    }
}

impl Decoder for FfmpegVideoDecoder {
    fn push(&mut self, packet: Packet) -> Result<(), CodecError> {
        self.flushed = false;
        self.decoder.push(av_packet(&packet))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushed = true;
        self.decoder.flush()?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Frame>, CodecError> {
        match self.decoder.take()? {
            Some(frame) => self.convert(frame).map(Some),
            None if self.flushed => Err(CodecError::Eof),
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        // frames buffered before a flush marker belong to the previous epoch
        let _ = self.decoder.flush();
        while let Ok(Some(_)) = self.decoder.take() {}
        self.scaler = None;
        self.flushed = false;
    }
}

/// Decodes audio and converts it to interleaved `flt` at the source rate
pub struct FfmpegAudioDecoder {
    decoder: AudioDecoder,
    resampler: Option<AudioResampler>,
    ready: VecDeque<Frame>,
    flushed: bool,
}

unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn new(params: &StreamParams) -> Result<Self, CodecError> {
        let decoder = AudioDecoder::builder(&params.codec)?
            .time_base(av_time_base(params.time_base))
            .extradata((!params.extradata.is_empty()).then(|| params.extradata.to_vec()))
            .build()?;
        Ok(Self {
            decoder,
            resampler: None,
            ready: VecDeque::new(),
            flushed: false,
        })
    }

    fn convert(&mut self, frame: AudioFrame) -> Result<(), CodecError> {
        let resampler = match self.resampler.as_mut() {
            Some(resampler) => resampler,
            None => self.resampler.insert(
                AudioResampler::builder()
                    .source_channel_layout(frame.channel_layout().to_owned())
                    .source_sample_format(frame.sample_format())
                    .source_sample_rate(frame.sample_rate())
                    .target_channel_layout(frame.channel_layout().to_owned())
                    .target_sample_format(get_sample_format(DECODED_SAMPLE_FORMAT))
                    .target_sample_rate(frame.sample_rate())
                    .build()?,
            ),
        };
        resampler.push(frame)?;
        while let Some(converted) = resampler.take()? {
            self.ready.push_back(pack_audio(&converted));
        }
        Ok(())
    }
}

impl Decoder for FfmpegAudioDecoder {
    fn push(&mut self, packet: Packet) -> Result<(), CodecError> {
        self.flushed = false;
        self.decoder.push(av_packet(&packet))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushed = true;
        self.decoder.flush()?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            match self.decoder.take()? {
                Some(frame) => self.convert(frame)?,
                None if self.flushed => return Err(CodecError::Eof),
                None => return Ok(None),
            }
        }
    }

    fn reset(&mut self) {
        let _ = self.decoder.flush();
        while let Ok(Some(_)) = self.decoder.take() {}
        self.resampler = None;
        self.ready.clear();
        self.flushed = false;
    }
}

/// Scales packed frames to the encoder size and pixel format
pub struct FfmpegScaler {
    width: usize,
    height: usize,
    pixel_format: String,
    /// Rebuilt whenever the input geometry changes (source switch)
    scaler: Option<((usize, usize, String), VideoFrameScaler)>,
    pending: Option<Frame>,
}

unsafe impl Send for FfmpegScaler {}

impl FrameFilter for FfmpegScaler {
    fn push(&mut self, frame: Frame) -> Result<(), CodecError> {
        if self.pending.is_some() {
            return Err(CodecError::Again);
        }
        let FrameFormat::Video {
            width,
            height,
            pixel_format,
        } = &frame.format
        else {
            return Err(CodecError::fatal("audio frame fed to the video scaler"));
        };
        let key = (*width as usize, *height as usize, pixel_format.clone());
        if key.0 == self.width && key.1 == self.height && key.2 == self.pixel_format {
            self.pending = Some(frame);
            return Ok(());
        }

        if self.scaler.as_ref().is_none_or(|(current, _)| *current != key) {
            let scaler = VideoFrameScaler::builder()
                .source_pixel_format(get_pixel_format(&key.2))
                .source_width(key.0)
                .source_height(key.1)
                .target_pixel_format(get_pixel_format(&self.pixel_format))
                .target_width(self.width)
                .target_height(self.height)
                .build()?;
            debug!(
                "FfmpegScaler: {}x{} {} -> {}x{} {}",
                key.0, key.1, key.2, self.width, self.height, self.pixel_format
            );
            self.scaler = Some((key, scaler));
        }
        let Some((_, scaler)) = self.scaler.as_mut() else {
            return Err(CodecError::fatal("scaler unavailable"));
        };
        let input = unpack_video(&frame)?.freeze();
        let scaled = scaler.scale(&input)?;
        let mut out = pack_video(&scaled, &self.pixel_format)?;
        out.pts = frame.pts;
        out.time_base = frame.time_base;
        self.pending = Some(out);
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Frame>, CodecError> {
        Ok(self.pending.take())
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}

/// Resamples `flt` audio to the output rate and layout in fixed-size frames
pub struct FfmpegResampler {
    sample_rate: u32,
    channels: u16,
    frame_samples: usize,
    resampler: Option<((u32, u16), AudioResampler)>,
}

unsafe impl Send for FfmpegResampler {}

impl FrameFilter for FfmpegResampler {
    fn push(&mut self, frame: Frame) -> Result<(), CodecError> {
        let FrameFormat::Audio {
            sample_rate,
            channels,
            ..
        } = &frame.format
        else {
            return Err(CodecError::fatal("video frame fed to the audio resampler"));
        };
        let key = (*sample_rate, *channels);
        if self.resampler.as_ref().is_none_or(|(current, _)| *current != key) {
            let resampler = AudioResampler::builder()
                .source_channel_layout(channel_layout(key.1)?)
                .source_sample_format(get_sample_format(DECODED_SAMPLE_FORMAT))
                .source_sample_rate(key.0)
                .target_channel_layout(channel_layout(self.channels)?)
                .target_sample_format(get_sample_format(DECODED_SAMPLE_FORMAT))
                .target_sample_rate(self.sample_rate)
                .target_frame_samples(Some(self.frame_samples))
                .build()?;
            self.resampler = Some((key, resampler));
        }
        let Some((_, resampler)) = self.resampler.as_mut() else {
            return Err(CodecError::fatal("resampler unavailable"));
        };
        resampler.push(unpack_audio(&frame)?.freeze())?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some((_, resampler)) = self.resampler.as_mut() else {
            return Ok(None);
        };
        Ok(resampler.take()?.map(|frame| pack_audio(&frame)))
    }

    fn reset(&mut self) {
        self.resampler = None;
    }
}

pub struct FfmpegVideoEncoder {
    encoder: VideoEncoder,
    codec_name: String,
    width: u32,
    height: u32,
    pixel_format: String,
    time_base: TimeBase,
}

unsafe impl Send for FfmpegVideoEncoder {}

impl FfmpegVideoEncoder {
    fn new(
        width: u32,
        height: u32,
        pixel_format: &str,
        time_base: TimeBase,
        config: &VideoConfig,
    ) -> Result<Self, CodecError> {
        let bit_rate = config.bit_rate.to_string();
        let max_rate = (config.bit_rate * 3 / 2).to_string();
        let buf_size = (config.bit_rate * 2).to_string();
        let gop = (config.fps * 2).to_string();

        let chain: Vec<(&str, &[(&str, &str)])> = match config.codec.as_deref() {
            Some(name) => vec![(name, &[])],
            None => VIDEO_ENCODER_CHAIN.to_vec(),
        };
        for (codec, options) in chain {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(builder) => builder,
                Err(e) => {
                    debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            builder = builder
                .pixel_format(get_pixel_format(pixel_format))
                .width(width as usize)
                .height(height as usize)
                .time_base(av_time_base(time_base))
                .bit_rate(config.bit_rate)
                .set_option("maxrate", &max_rate)
                .set_option("bufsize", &buf_size)
                .set_option("g", &gop);
            if codec != "libx264" {
                builder = builder.set_option("b", &bit_rate);
            }
            for (k, v) in options {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(encoder) => {
                    info!("Using encoder: {}", codec);
                    return Ok(Self {
                        encoder,
                        codec_name: codec.to_string(),
                        width,
                        height,
                        pixel_format: pixel_format.to_string(),
                        time_base,
                    });
                }
                Err(e) => debug!("Encoder {} failed to initialize: {}", codec, e),
            }
        }
        Err(CodecError::fatal("no H.264 encoder available"))
    }
}

impl Encoder for FfmpegVideoEncoder {
    fn params(&self) -> StreamParams {
        let mut params = StreamParams::video(&self.codec_name, self.width, self.height, self.time_base);
        params.pixel_format = self.pixel_format.clone();
        params.extradata = self
            .encoder
            .codec_parameters()
            .extradata()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        params
    }

    fn push(&mut self, frame: Frame) -> Result<(), CodecError> {
        let picture_type = if frame.force_keyframe {
            PictureType::I
        } else {
            PictureType::None
        };
        let frame = unpack_video(&frame)?.with_picture_type(picture_type).freeze();
        self.encoder.push(frame)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.encoder.flush()?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Packet>, CodecError> {
        Ok(self.encoder.take()?.map(|packet| packet_of(&packet, MediaKind::Video)))
    }
}

/// Audio encoder fed `flt` frames; converts to the codec's sample format and
/// frame size
pub struct FfmpegAudioEncoder {
    encoder: AudioEncoder,
    resampler: AudioResampler,
    codec_name: String,
    time_base: TimeBase,
    /// pts of the next resampled frame, from the first input frame on
    next_pts: Option<i64>,
}

unsafe impl Send for FfmpegAudioEncoder {}

impl FfmpegAudioEncoder {
    fn new(sample_rate: u32, channels: u16, time_base: TimeBase, config: &AudioConfig) -> Result<Self, CodecError> {
        let chain: Vec<&str> = match config.codec.as_deref() {
            Some(name) => vec![name],
            None => AUDIO_ENCODER_CHAIN.to_vec(),
        };
        for codec in chain {
            let builder = match AudioEncoder::builder(codec) {
                Ok(builder) => builder,
                Err(e) => {
                    debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            let sample_format = if codec == "aac" { "fltp" } else { DECODED_SAMPLE_FORMAT };
            let built = builder
                .sample_rate(sample_rate)
                .channel_layout(channel_layout(channels)?)
                .sample_format(get_sample_format(sample_format))
                .time_base(av_time_base(time_base))
                .bit_rate(config.bit_rate)
                .build();
            let encoder = match built {
                Ok(encoder) => encoder,
                Err(e) => {
                    debug!("Encoder {} failed to initialize: {}", codec, e);
                    continue;
                }
            };
            let resampler = AudioResampler::builder()
                .source_channel_layout(channel_layout(channels)?)
                .source_sample_format(get_sample_format(DECODED_SAMPLE_FORMAT))
                .source_sample_rate(sample_rate)
                .target_channel_layout(channel_layout(channels)?)
                .target_sample_format(get_sample_format(sample_format))
                .target_sample_rate(sample_rate)
                .target_frame_samples(encoder.samples_per_frame())
                .build()?;
            info!("Using encoder: {}", codec);
            return Ok(Self {
                encoder,
                resampler,
                codec_name: codec.to_string(),
                time_base,
                next_pts: None,
            });
        }
        Err(CodecError::fatal("no audio encoder available"))
    }

    fn drain_resampler(&mut self) -> Result<(), CodecError> {
        let tb = av_time_base(self.time_base);
        while let Some(frame) = self.resampler.take()? {
            let pts = self.next_pts.unwrap_or(0);
            self.next_pts = Some(pts + frame.samples() as i64);
            self.encoder.push(frame.with_pts(Timestamp::new(pts, tb)))?;
        }
        Ok(())
    }
}

impl Encoder for FfmpegAudioEncoder {
    fn params(&self) -> StreamParams {
        let codec = self.encoder.codec_parameters();
        let mut params = StreamParams::audio(
            &self.codec_name,
            codec.sample_rate(),
            codec.channel_layout().channels() as u16,
            self.time_base,
        );
        params.sample_format = codec.sample_format().name().to_string();
        params.extradata = codec.extradata().map(Bytes::copy_from_slice).unwrap_or_default();
        params
    }

    fn push(&mut self, frame: Frame) -> Result<(), CodecError> {
        if self.next_pts.is_none() {
            self.next_pts = frame.pts;
        }
        self.resampler.push(unpack_audio(&frame)?.freeze())?;
        self.drain_resampler()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.resampler.flush()?;
        self.drain_resampler()?;
        self.encoder.flush()?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Packet>, CodecError> {
        Ok(self.encoder.take()?.map(|packet| packet_of(&packet, MediaKind::Audio)))
    }
}

enum SinkMuxer {
    File(Muxer<File>),
    Stream(Muxer<TcpStream>),
}

/// Container written through an FFmpeg muxer; built when the header is due
pub struct FfmpegSink {
    output: OutputConfig,
    streams: Vec<CodecParameters>,
    muxer: Option<SinkMuxer>,
}

unsafe impl Send for FfmpegSink {}

impl FfmpegSink {
    fn codec_parameters(params: &StreamParams) -> Result<CodecParameters, CodecError> {
        let extradata = (!params.extradata.is_empty()).then_some(&params.extradata[..]);
        Ok(match params.kind {
            MediaKind::Video => VideoCodecParameters::builder(&params.codec)?
                .pixel_format(get_pixel_format(&params.pixel_format))
                .width(params.width as usize)
                .height(params.height as usize)
                .extradata(extradata)
                .build()
                .into(),
            MediaKind::Audio => AudioCodecParameters::builder(&params.codec)?
                .sample_rate(params.sample_rate)
                .sample_format(get_sample_format(&params.sample_format))
                .channel_layout(&channel_layout(params.channels)?)
                .extradata(extradata)
                .build()
                .into(),
        })
    }

    fn build<T: std::io::Write>(&self, io: IO<T>, format: OutputFormat) -> Result<Muxer<T>, CodecError> {
        let mut builder = Muxer::builder();
        for stream in &self.streams {
            builder.add_stream(stream)?;
        }
        for (key, value) in &self.output.options {
            builder = builder.set_option(key, value);
        }
        Ok(builder.build(io, format)?)
    }
}

impl ContainerSink for FfmpegSink {
    fn add_stream(&mut self, params: &StreamParams) -> Result<(usize, TimeBase), CodecError> {
        self.streams.push(Self::codec_parameters(params)?);
        Ok((self.streams.len() - 1, params.time_base))
    }

    fn write_header(&mut self) -> Result<(), CodecError> {
        let path = self.output.path.to_string_lossy().to_string();
        let format = match self.output.container_format.as_deref() {
            Some(name) => OutputFormat::find_by_name(name),
            None => OutputFormat::guess_from_file_name(&path),
        }
        .ok_or_else(|| CodecError::fatal(format!("cannot pick a container for {}", path)))?;

        let muxer = if let Some(address) = path.strip_prefix("tcp://") {
            let stream = TcpStream::connect(address).map_err(CodecError::fatal)?;
            SinkMuxer::Stream(self.build(IO::from_write_stream(stream), format)?)
        } else {
            let file = File::create(&self.output.path).map_err(CodecError::fatal)?;
            SinkMuxer::File(self.build(IO::from_seekable_write_stream(file), format)?)
        };
        info!("FfmpegSink: header written to {}", path);
        self.muxer = Some(muxer);
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet) -> Result<(), CodecError> {
        let packet = av_packet(&packet);
        match self.muxer.as_mut() {
            Some(SinkMuxer::File(muxer)) => muxer.push(packet)?,
            Some(SinkMuxer::Stream(muxer)) => muxer.push(packet)?,
            None => return Err(CodecError::fatal("header not written")),
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), CodecError> {
        match self.muxer.take() {
            Some(SinkMuxer::File(mut muxer)) => {
                muxer.flush()?;
                muxer.close()?;
            }
            Some(SinkMuxer::Stream(mut muxer)) => {
                muxer.flush()?;
                muxer.close()?;
            }
            None => warn!("FfmpegSink: trailer requested without a header"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_geometry_rounds_chroma_up() {
        assert_eq!(
            plane_geometry("yuv420p", 5, 3),
            Some(vec![(5, 3), (3, 2), (3, 2)])
        );
        assert_eq!(plane_geometry("nv12", 4, 4), Some(vec![(4, 4), (4, 2)]));
        assert_eq!(plane_geometry("rgb24", 4, 4), None);
    }

    #[test]
    fn test_copy_plane_strips_padding() {
        let src = [1, 2, 0, 0, 3, 4, 0, 0];
        let mut dst = [0u8; 4];
        copy_plane(&mut dst, 2, &src, 4, 2, 2);
        assert_eq!(dst, [1, 2, 3, 4]);
    }
}
