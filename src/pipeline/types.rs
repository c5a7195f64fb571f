//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rational time base, `num/den` seconds per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MICROS: TimeBase = TimeBase::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// A time base is usable only when both terms are positive
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Rescale `value` expressed in `self` into `to`.
    ///
    /// Rounds half away from zero. Both time bases must be valid; an invalid
    /// target yields 0.
    pub fn rescale(&self, value: i64, to: TimeBase) -> i64 {
        let num = value as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return 0;
        }
        let negative = (num < 0) != (den < 0);
        let (num, den) = (num.abs(), den.abs());
        let rounded = (num + den / 2) / den;
        let rounded = if negative { -rounded } else { rounded };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn to_micros(&self, value: i64) -> i64 {
        self.rescale(value, Self::MICROS)
    }

    pub fn from_micros(&self, micros: i64) -> i64 {
        Self::MICROS.rescale(micros, *self)
    }

    /// Ticks covered by a wall-clock duration
    pub fn from_duration(&self, duration: Duration) -> i64 {
        self.from_micros(duration.as_micros().min(i64::MAX as u128) as i64)
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Capture device roles a recorder can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Screen,
    Camera,
    SystemAudio,
    Microphone,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Screen,
        SourceKind::Camera,
        SourceKind::SystemAudio,
        SourceKind::Microphone,
    ];

    pub fn media(&self) -> MediaKind {
        match self {
            SourceKind::Screen | SourceKind::Camera => MediaKind::Video,
            SourceKind::SystemAudio | SourceKind::Microphone => MediaKind::Audio,
        }
    }

    /// The other source of the same media kind, used for hot swaps
    pub fn counterpart(&self) -> SourceKind {
        match self {
            SourceKind::Screen => SourceKind::Camera,
            SourceKind::Camera => SourceKind::Screen,
            SourceKind::SystemAudio => SourceKind::Microphone,
            SourceKind::Microphone => SourceKind::SystemAudio,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Screen => "screen",
            SourceKind::Camera => "camera",
            SourceKind::SystemAudio => "system_audio",
            SourceKind::Microphone => "microphone",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw buffer layout of a decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFormat {
    Video {
        width: u32,
        height: u32,
        pixel_format: String,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        sample_format: String,
    },
}

impl FrameFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            FrameFormat::Video { .. } => MediaKind::Video,
            FrameFormat::Audio { .. } => MediaKind::Audio,
        }
    }
}

/// Compressed, codec-specific unit of media data
#[derive(Clone)]
pub struct Packet {
    pub kind: MediaKind,
    pub data: Bytes,
    /// Presentation timestamp in `time_base`, `None` when unknown
    pub pts: Option<i64>,
    /// Decode timestamp in `time_base`
    pub dts: Option<i64>,
    pub duration: i64,
    pub time_base: TimeBase,
    pub keyframe: bool,
    /// Index of the output stream this packet belongs to
    pub stream_index: usize,
}

impl Packet {
    pub fn new(kind: MediaKind, data: Bytes, pts: Option<i64>, time_base: TimeBase) -> Self {
        Self {
            kind,
            data,
            pts,
            dts: pts,
            duration: 0,
            time_base,
            keyframe: false,
            stream_index: 0,
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn with_stream_index(mut self, index: usize) -> Self {
        self.stream_index = index;
        self
    }

    /// Presentation time in microseconds, if known
    pub fn pts_micros(&self) -> Option<i64> {
        self.pts.map(|pts| self.time_base.to_micros(pts))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("time_base", &self.time_base)
            .field("keyframe", &self.keyframe)
            .field("stream_index", &self.stream_index)
            .field("size", &self.size())
            .finish()
    }
}

/// Decoded raw sample or pixel buffer
#[derive(Clone)]
pub struct Frame {
    pub format: FrameFormat,
    pub data: Bytes,
    pub pts: Option<i64>,
    pub time_base: TimeBase,
    /// Samples per channel (audio only)
    pub nb_samples: usize,
    /// Request an intra frame from the encoder
    pub force_keyframe: bool,
}

impl Frame {
    /// Create a new video frame
    pub fn video(width: u32, height: u32, pixel_format: &str, data: Bytes) -> Self {
        Self {
            format: FrameFormat::Video {
                width,
                height,
                pixel_format: pixel_format.to_string(),
            },
            data,
            pts: None,
            time_base: TimeBase::MICROS,
            nb_samples: 0,
            force_keyframe: false,
        }
    }

    /// Create a new audio frame
    pub fn audio(
        sample_rate: u32,
        channels: u16,
        sample_format: &str,
        nb_samples: usize,
        data: Bytes,
    ) -> Self {
        Self {
            format: FrameFormat::Audio {
                sample_rate,
                channels,
                sample_format: sample_format.to_string(),
            },
            data,
            pts: None,
            time_base: TimeBase::new(1, sample_rate.max(1) as i32),
            nb_samples,
            force_keyframe: false,
        }
    }

    /// Interleaved 32-bit float silence
    pub fn silence(sample_rate: u32, channels: u16, nb_samples: usize) -> Self {
        let len = nb_samples * channels as usize * std::mem::size_of::<f32>();
        Self::audio(
            sample_rate,
            channels,
            "flt",
            nb_samples,
            Bytes::from(vec![0u8; len]),
        )
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn with_pts(mut self, pts: i64, time_base: TimeBase) -> Self {
        self.pts = Some(pts);
        self.time_base = time_base;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Frame");
        debug
            .field("format", &self.format)
            .field("pts", &self.pts)
            .field("time_base", &self.time_base)
            .field("size", &self.size());

        if self.nb_samples > 0 {
            debug.field("nb_samples", &self.nb_samples);
        }
        if self.force_keyframe {
            debug.field("force_keyframe", &true);
        }

        debug.finish()
    }
}

/// Codec parameters describing one output or input stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub kind: MediaKind,
    pub codec: String,
    pub time_base: TimeBase,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: String,
    pub bit_rate: u64,
    pub extradata: Bytes,
}

impl StreamParams {
    pub fn video(codec: &str, width: u32, height: u32, time_base: TimeBase) -> Self {
        Self {
            kind: MediaKind::Video,
            codec: codec.to_string(),
            time_base,
            width,
            height,
            pixel_format: "yuv420p".to_string(),
            sample_rate: 0,
            channels: 0,
            sample_format: String::new(),
            bit_rate: 0,
            extradata: Bytes::new(),
        }
    }

    pub fn audio(codec: &str, sample_rate: u32, channels: u16, time_base: TimeBase) -> Self {
        Self {
            kind: MediaKind::Audio,
            codec: codec.to_string(),
            time_base,
            width: 0,
            height: 0,
            pixel_format: String::new(),
            sample_rate,
            channels,
            sample_format: "flt".to_string(),
            bit_rate: 0,
            extradata: Bytes::new(),
        }
    }

    /// Raw frame layout produced by a decoder for this stream
    pub fn frame_format(&self) -> FrameFormat {
        match self.kind {
            MediaKind::Video => FrameFormat::Video {
                width: self.width,
                height: self.height,
                pixel_format: self.pixel_format.clone(),
            },
            MediaKind::Audio => FrameFormat::Audio {
                sample_rate: self.sample_rate,
                channels: self.channels,
                sample_format: self.sample_format.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_rounds_half_away_from_zero() {
        let ms = TimeBase::new(1, 1000);
        let half = TimeBase::new(1, 2000);
        assert_eq!(half.rescale(3, ms), 2);
        assert_eq!(half.rescale(-3, ms), -2);
        assert_eq!(half.rescale(1, ms), 1);
    }

    #[test]
    fn test_rescale_common_bases() {
        let fps30 = TimeBase::new(1, 30);
        let mpeg = TimeBase::new(1, 90_000);
        assert_eq!(fps30.rescale(1, mpeg), 3000);
        assert_eq!(fps30.to_micros(1), 33_333);
        assert_eq!(TimeBase::new(1, 48_000).to_micros(1024), 21_333);
        assert_eq!(fps30.from_duration(Duration::from_millis(500)), 15);
    }

    #[test]
    fn test_invalid_time_base() {
        assert!(!TimeBase::new(0, 30).is_valid());
        assert!(!TimeBase::new(1, -1).is_valid());
        assert_eq!(TimeBase::new(1, 30).rescale(5, TimeBase::new(0, 1)), 0);
    }

    #[test]
    fn test_source_kind_counterparts() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.counterpart().counterpart(), kind);
            assert_eq!(kind.counterpart().media(), kind.media());
        }
    }

    #[test]
    fn test_silence_frame_layout() {
        let frame = Frame::silence(48_000, 2, 1024);
        assert_eq!(frame.size(), 1024 * 2 * 4);
        assert_eq!(frame.kind(), MediaKind::Audio);
        assert!(frame.data.iter().all(|b| *b == 0));
    }
}
