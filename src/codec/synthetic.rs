//! Deterministic in-process codec runtime
//!
//! Sources emit paced test packets on a fixed grid from the instant they are
//! opened (video frame `n` is due at `open + n / fps`, audio frames carry
//! `frame_samples` samples each). Decoders and encoders pass payloads through
//! one-to-one. The sink records everything it receives in a [`SinkProbe`] and
//! can dump that record as JSON when the trailer is written.

use super::{
    CaptureSource, CodecRuntime, ContainerSink, Decoder, Encoder, FrameFilter, PassthroughFilter,
};
use crate::config::{AudioConfig, OutputConfig, RecorderConfig, SourceSpec, VideoConfig};
use crate::error::CodecError;
use crate::pipeline::types::{
    Frame, FrameFormat, MediaKind, Packet, SourceKind, StreamParams, TimeBase,
};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Container time base used for video streams
const VIDEO_STREAM_TIME_BASE: TimeBase = TimeBase::new(1, 90_000);
/// Longest single sleep inside `read_packet`, keeps stop latency bounded
const MAX_PACE_SLEEP: Duration = Duration::from_millis(10);
/// Frames a decoder or encoder buffers before asking for `take`
const CODEC_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_samples: usize,
    /// Sources report EOF after this many packets
    pub packet_limit: Option<u64>,
    /// Sources fail fatally after this many packets
    pub fail_after: Option<u64>,
    /// Write a JSON report to the output path with the trailer
    pub write_report: bool,
}

impl SyntheticOptions {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            fps: config.video.fps,
            width: config.video.width,
            height: config.video.height,
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            frame_samples: config.audio.frame_samples,
            packet_limit: None,
            fail_after: None,
            write_report: false,
        }
    }
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self::from_config(&RecorderConfig::default())
    }
}

/// Codec runtime without native dependencies
pub struct SyntheticRuntime {
    options: SyntheticOptions,
    probe: SinkProbe,
}

impl SyntheticRuntime {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            probe: SinkProbe::default(),
        }
    }

    /// Shared view of everything the sinks of this runtime received
    pub fn probe(&self) -> SinkProbe {
        self.probe.clone()
    }
}

impl CodecRuntime for SyntheticRuntime {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open_source(&self, kind: SourceKind, spec: &SourceSpec) -> Result<Box<dyn CaptureSource>, CodecError> {
        debug!("Synthetic: opening {} source ({} via {})", kind, spec.url, spec.format);
        Ok(Box::new(SyntheticSource::new(kind, &self.options)))
    }

    fn open_decoder(&self, params: &StreamParams) -> Result<Box<dyn Decoder>, CodecError> {
        Ok(Box::new(SyntheticDecoder::new(params, self.options.frame_samples)))
    }

    fn open_video_filter(&self, config: &VideoConfig) -> Result<Box<dyn FrameFilter>, CodecError> {
        Ok(Box::new(SyntheticScaler {
            width: config.width,
            height: config.height,
            pixel_format: config.pixel_format.clone(),
            pending: None,
        }))
    }

    fn open_audio_filter(&self, _config: &AudioConfig) -> Result<Box<dyn FrameFilter>, CodecError> {
        Ok(Box::new(PassthroughFilter::default()))
    }

    fn open_encoder(
        &self,
        kind: MediaKind,
        input: &Frame,
        time_base: TimeBase,
        video: &VideoConfig,
        audio: &AudioConfig,
    ) -> Result<Box<dyn Encoder>, CodecError> {
        let params = match (&input.format, kind) {
            (FrameFormat::Video { width, height, .. }, MediaKind::Video) => {
                let codec = video.codec.as_deref().unwrap_or("synthetic-video");
                StreamParams::video(codec, *width, *height, time_base)
            }
            (FrameFormat::Audio { sample_rate, channels, .. }, MediaKind::Audio) => {
                let codec = audio.codec.as_deref().unwrap_or("synthetic-audio");
                StreamParams::audio(codec, *sample_rate, *channels, time_base)
            }
            _ => {
                return Err(CodecError::fatal(format!(
                    "{} encoder fed a {} frame",
                    kind,
                    input.kind()
                )));
            }
        };
        Ok(Box::new(SyntheticEncoder::new(params, self.options.fps)))
    }

    fn open_sink(&self, output: &OutputConfig) -> Result<Box<dyn ContainerSink>, CodecError> {
        self.probe.reset();
        let report_path = (self.options.write_report && !output.is_network()).then(|| output.path.clone());
        Ok(Box::new(MemorySink {
            probe: self.probe.clone(),
            report_path,
            next_index: 0,
        }))
    }
}

/// Paced test-pattern source
pub struct SyntheticSource {
    kind: SourceKind,
    params: StreamParams,
    opened: Instant,
    interval: Duration,
    ticks_per_packet: i64,
    payload_len: usize,
    emitted: u64,
    packet_limit: Option<u64>,
    fail_after: Option<u64>,
}

impl SyntheticSource {
    pub fn new(kind: SourceKind, options: &SyntheticOptions) -> Self {
        let (params, interval, ticks_per_packet, payload_len) = match kind.media() {
            MediaKind::Video => {
                let fps = options.fps.max(1);
                let params =
                    StreamParams::video("rawvideo", options.width, options.height, TimeBase::new(1, fps as i32));
                (params, Duration::from_secs(1) / fps, 1, 64)
            }
            MediaKind::Audio => {
                let rate = options.sample_rate.max(1);
                let params = StreamParams::audio("pcm_f32le", rate, options.channels, TimeBase::new(1, rate as i32));
                let samples = options.frame_samples as u64;
                (
                    params,
                    Duration::from_micros(samples * 1_000_000 / rate as u64),
                    options.frame_samples as i64,
                    options.frame_samples * options.channels as usize * 4,
                )
            }
        };
        Self {
            kind,
            params,
            opened: Instant::now(),
            interval,
            ticks_per_packet,
            payload_len,
            emitted: 0,
            packet_limit: options.packet_limit,
            fail_after: options.fail_after,
        }
    }

    fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload_len.max(9));
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.emitted);
        buf.resize(self.payload_len.max(9), 0);
        buf.freeze()
    }
}

impl CaptureSource for SyntheticSource {
    fn stream_params(&self) -> StreamParams {
        self.params.clone()
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        if self.packet_limit.is_some_and(|limit| self.emitted >= limit) {
            return Err(CodecError::Eof);
        }
        if self.fail_after.is_some_and(|limit| self.emitted >= limit) {
            return Err(CodecError::fatal(format!("{} source: device lost", self.kind)));
        }

        let due = self.opened + self.interval * self.emitted as u32;
        let now = Instant::now();
        if now < due {
            std::thread::sleep((due - now).min(MAX_PACE_SLEEP));
            if Instant::now() < due {
                return Err(CodecError::Again);
            }
        }

        let pts = self.emitted as i64 * self.ticks_per_packet;
        let packet = Packet::new(self.params.kind, self.payload(), Some(pts), self.params.time_base)
            .with_duration(self.ticks_per_packet)
            .with_keyframe(true);
        self.emitted += 1;
        Ok(packet)
    }
}

/// One packet in, one frame out
pub struct SyntheticDecoder {
    format: FrameFormat,
    frame_samples: usize,
    pending: VecDeque<Frame>,
    flushed: bool,
}

impl SyntheticDecoder {
    pub fn new(params: &StreamParams, frame_samples: usize) -> Self {
        Self {
            format: params.frame_format(),
            frame_samples,
            pending: VecDeque::new(),
            flushed: false,
        }
    }
}

impl Decoder for SyntheticDecoder {
    fn push(&mut self, packet: Packet) -> Result<(), CodecError> {
        if self.pending.len() >= CODEC_DEPTH {
            return Err(CodecError::Again);
        }
        let nb_samples = match self.format {
            FrameFormat::Audio { .. } => self.frame_samples,
            FrameFormat::Video { .. } => 0,
        };
        self.pending.push_back(Frame {
            format: self.format.clone(),
            data: packet.data,
            pts: packet.pts,
            time_base: packet.time_base,
            nb_samples,
            force_keyframe: false,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushed = true;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Frame>, CodecError> {
        match self.pending.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.flushed => Err(CodecError::Eof),
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.flushed = false;
    }
}

/// Rewrites the frame geometry to the configured output size
struct SyntheticScaler {
    width: u32,
    height: u32,
    pixel_format: String,
    pending: Option<Frame>,
}

impl FrameFilter for SyntheticScaler {
    fn push(&mut self, mut frame: Frame) -> Result<(), CodecError> {
        if self.pending.is_some() {
            return Err(CodecError::Again);
        }
        if let FrameFormat::Video { .. } = frame.format {
            frame.format = FrameFormat::Video {
                width: self.width,
                height: self.height,
                pixel_format: self.pixel_format.clone(),
            };
        }
        self.pending = Some(frame);
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Frame>, CodecError> {
        Ok(self.pending.take())
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}

/// One frame in, one packet out; keyframe every two seconds or on request
pub struct SyntheticEncoder {
    params: StreamParams,
    gop: u64,
    encoded: u64,
    pending: VecDeque<Packet>,
    flushed: bool,
}

impl SyntheticEncoder {
    pub fn new(params: StreamParams, fps: u32) -> Self {
        Self {
            params,
            gop: (fps.max(1) as u64) * 2,
            encoded: 0,
            pending: VecDeque::new(),
            flushed: false,
        }
    }
}

impl Encoder for SyntheticEncoder {
    fn params(&self) -> StreamParams {
        self.params.clone()
    }

    fn push(&mut self, frame: Frame) -> Result<(), CodecError> {
        if self.pending.len() >= CODEC_DEPTH {
            return Err(CodecError::Again);
        }
        let keyframe = match self.params.kind {
            MediaKind::Video => frame.force_keyframe || self.encoded % self.gop == 0,
            MediaKind::Audio => true,
        };
        let duration = match self.params.kind {
            MediaKind::Video => 1,
            MediaKind::Audio => frame.nb_samples as i64,
        };
        let packet = Packet::new(self.params.kind, frame.data, frame.pts, frame.time_base)
            .with_duration(duration)
            .with_keyframe(keyframe);
        self.pending.push_back(packet);
        self.encoded += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushed = true;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Packet>, CodecError> {
        match self.pending.pop_front() {
            Some(packet) => Ok(Some(packet)),
            None if self.flushed => Err(CodecError::Eof),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportStream {
    pub index: usize,
    pub kind: MediaKind,
    pub codec: String,
    pub time_base: TimeBase,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPacket {
    pub stream_index: usize,
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub keyframe: bool,
    pub size: usize,
}

/// Everything a [`MemorySink`] received
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkReport {
    pub streams: Vec<ReportStream>,
    pub headers_written: u32,
    pub trailers_written: u32,
    pub packets: Vec<ReportPacket>,
}

impl SinkReport {
    pub fn packets_of(&self, kind: MediaKind) -> impl Iterator<Item = &ReportPacket> {
        self.packets.iter().filter(move |p| p.kind == kind)
    }
}

/// Shared handle onto the sink record
#[derive(Debug, Clone, Default)]
pub struct SinkProbe {
    report: Arc<Mutex<SinkReport>>,
}

impl SinkProbe {
    pub fn snapshot(&self) -> SinkReport {
        self.report.lock().clone()
    }

    pub fn reset(&self) {
        *self.report.lock() = SinkReport::default();
    }

    fn update(&self, f: impl FnOnce(&mut SinkReport)) {
        f(&mut self.report.lock());
    }
}

/// Container sink that keeps its output in memory
pub struct MemorySink {
    probe: SinkProbe,
    report_path: Option<PathBuf>,
    next_index: usize,
}

impl MemorySink {
    pub fn new(probe: SinkProbe) -> Self {
        Self {
            probe,
            report_path: None,
            next_index: 0,
        }
    }
}

impl ContainerSink for MemorySink {
    fn add_stream(&mut self, params: &StreamParams) -> Result<(usize, TimeBase), CodecError> {
        let index = self.next_index;
        self.next_index += 1;
        let time_base = match params.kind {
            MediaKind::Video => VIDEO_STREAM_TIME_BASE,
            MediaKind::Audio => params.time_base,
        };
        self.probe.update(|r| {
            r.streams.push(ReportStream {
                index,
                kind: params.kind,
                codec: params.codec.clone(),
                time_base,
            })
        });
        Ok((index, time_base))
    }

    fn write_header(&mut self) -> Result<(), CodecError> {
        self.probe.update(|r| r.headers_written += 1);
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet) -> Result<(), CodecError> {
        self.probe.update(|r| {
            r.packets.push(ReportPacket {
                stream_index: packet.stream_index,
                kind: packet.kind,
                pts: packet.pts,
                dts: packet.dts,
                keyframe: packet.keyframe,
                size: packet.size(),
            })
        });
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), CodecError> {
        self.probe.update(|r| r.trailers_written += 1);
        if let Some(path) = &self.report_path {
            let report = self.probe.snapshot();
            let file = std::fs::File::create(path)
                .map_err(|e| CodecError::fatal(format!("{}: {}", path.display(), e)))?;
            serde_json::to_writer_pretty(file, &report).map_err(CodecError::fatal)?;
            info!(
                "Synthetic: wrote report with {} packets to {}",
                report.packets.len(),
                path.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SyntheticOptions {
        SyntheticOptions {
            fps: 100,
            packet_limit: Some(3),
            ..SyntheticOptions::default()
        }
    }

    #[test]
    fn test_source_paces_and_ends() {
        let mut source = SyntheticSource::new(SourceKind::Screen, &options());
        let started = Instant::now();
        let mut pts = Vec::new();
        loop {
            match source.read_packet() {
                Ok(packet) => pts.push(packet.pts.unwrap()),
                Err(CodecError::Again) => continue,
                Err(CodecError::Eof) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(pts, vec![0, 1, 2]);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_source_failure_injection() {
        let mut source = SyntheticSource::new(
            SourceKind::Microphone,
            &SyntheticOptions {
                fail_after: Some(0),
                ..SyntheticOptions::default()
            },
        );
        assert!(source.read_packet().unwrap_err().is_fatal());
    }

    #[test]
    fn test_decoder_backpressure_and_drain() {
        let params = StreamParams::audio("pcm_f32le", 48_000, 2, TimeBase::new(1, 48_000));
        let mut decoder = SyntheticDecoder::new(&params, 1024);
        for i in 0..CODEC_DEPTH as i64 {
            decoder
                .push(Packet::new(MediaKind::Audio, Bytes::new(), Some(i), params.time_base))
                .unwrap();
        }
        assert_eq!(
            decoder.push(Packet::new(MediaKind::Audio, Bytes::new(), Some(9), params.time_base)),
            Err(CodecError::Again)
        );
        decoder.flush().unwrap();
        let mut frames = 0;
        loop {
            match decoder.take() {
                Ok(Some(frame)) => {
                    assert_eq!(frame.nb_samples, 1024);
                    frames += 1;
                }
                Ok(None) => panic!("flushed decoder asked for input"),
                Err(e) => {
                    assert_eq!(e, CodecError::Eof);
                    break;
                }
            }
        }
        assert_eq!(frames, CODEC_DEPTH);
    }

    #[test]
    fn test_encoder_forces_keyframe() {
        let params = StreamParams::video("synthetic-video", 64, 64, TimeBase::new(1, 30));
        let mut encoder = SyntheticEncoder::new(params, 30);
        let frame = |pts: i64, force: bool| Frame {
            force_keyframe: force,
            ..Frame::video(64, 64, "yuv420p", Bytes::new()).with_pts(pts, TimeBase::new(1, 30))
        };
        encoder.push(frame(0, false)).unwrap();
        encoder.push(frame(1, false)).unwrap();
        encoder.push(frame(2, true)).unwrap();
        let keys: Vec<bool> = std::iter::from_fn(|| encoder.take().ok().flatten())
            .map(|p| p.keyframe)
            .collect();
        assert_eq!(keys, vec![true, false, true]);
    }

    #[test]
    fn test_sink_report_written_on_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = SyntheticRuntime::new(SyntheticOptions {
            write_report: true,
            ..SyntheticOptions::default()
        });
        let output = OutputConfig {
            path: dir.path().join("out.json"),
            ..OutputConfig::default()
        };
        let mut sink = runtime.open_sink(&output).unwrap();
        let params = StreamParams::video("v", 64, 64, TimeBase::new(1, 30));
        assert_eq!(sink.add_stream(&params).unwrap(), (0, VIDEO_STREAM_TIME_BASE));
        sink.write_header().unwrap();
        sink.write_packet(Packet::new(MediaKind::Video, Bytes::from_static(b"x"), Some(0), VIDEO_STREAM_TIME_BASE))
            .unwrap();
        sink.write_trailer().unwrap();

        let report = runtime.probe().snapshot();
        assert_eq!(report.headers_written, 1);
        assert_eq!(report.trailers_written, 1);
        let text = std::fs::read_to_string(&output.path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["packets"].as_array().unwrap().len(), 1);
        assert_eq!(json["streams"][0]["kind"], "video");
    }
}
