//! Recorder configuration
//!
//! Loaded from a JSON file (every field optional, missing fields take their
//! defaults) and then overridden from the command line.

use crate::error::ConfigError;
use crate::muxer::SyncPolicy;
use crate::pipeline::types::{MediaKind, SourceKind};
use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub output: OutputConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub sources: SourceTable,
    pub queues: QueueConfig,
    pub sync: SyncPolicy,
    pub events: EventConfig,
    /// How long `stop` waits for the pipeline to drain before forcing teardown
    pub drain_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            sources: SourceTable::default(),
            queues: QueueConfig::default(),
            sync: SyncPolicy::default(),
            events: EventConfig::default(),
            drain_timeout_ms: 5000,
        }
    }
}

impl RecorderConfig {
    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: RecorderConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.path.as_os_str().is_empty() {
            return Err(ConfigError::Empty("output.path"));
        }
        range("video.fps", self.video.fps as u64, 1, 240)?;
        range("video.width", self.video.width as u64, 16, 8192)?;
        range("video.height", self.video.height as u64, 16, 8192)?;
        range("audio.sample_rate", self.audio.sample_rate as u64, 8000, 192_000)?;
        range("audio.channels", self.audio.channels as u64, 1, 8)?;
        range("audio.frame_samples", self.audio.frame_samples as u64, 64, 8192)?;
        range("queues.packets", self.queues.packets as u64, 1, 256)?;
        range("queues.video_frames", self.queues.video_frames as u64, 1, 256)?;
        range("queues.audio_frames", self.queues.audio_frames as u64, 1, 256)?;
        range("queues.encoded", self.queues.encoded as u64, 1, 1024)?;
        range("events.queue_capacity", self.events.queue_capacity as u64, 1, 64)?;
        range("events.pool_size", self.events.pool_size as u64, 1, 64)?;

        if self.video.source.media() != MediaKind::Video {
            return Err(ConfigError::WrongMedia("video", MediaKind::Audio));
        }
        if let Some(source) = self.audio.source
            && source.media() != MediaKind::Audio
        {
            return Err(ConfigError::WrongMedia("audio", MediaKind::Video));
        }
        // The header waits for both streams
        if self.audio.source.is_none() && !self.audio.silence_when_idle {
            return Err(ConfigError::NoAudioStream);
        }
        for kind in SourceKind::ALL {
            if self.sources.get(kind).url.is_empty() {
                return Err(ConfigError::Empty("sources.*.url"));
            }
        }
        Ok(())
    }
}

fn range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

/// Where and how the container is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// File path, or URL for streamed formats
    pub path: PathBuf,
    /// Container short name (`mp4`, `matroska`, `rtsp`...); guessed from the
    /// path when absent
    pub container_format: Option<String>,
    /// Extra muxer options
    pub options: BTreeMap<String, String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            container_format: None,
            options: BTreeMap::new(),
        }
    }
}

impl OutputConfig {
    /// Network outputs are not opened as files
    pub fn is_network(&self) -> bool {
        let path = self.path.to_string_lossy();
        path.contains("://")
            || matches!(self.container_format.as_deref(), Some("rtsp" | "rtmp" | "flv"))
    }
}

/// `recording-YYYYmmdd-HHMMSS.mp4` in the working directory
pub fn default_output_path() -> PathBuf {
    PathBuf::from(format!(
        "recording-{}.mp4",
        Local::now().format("%Y%m%d-%H%M%S")
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub fps: u32,
    /// Encoded output size
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    /// Source selected at startup
    pub source: SourceKind,
    /// Encoder name; the hardware fallback chain is used when absent
    pub codec: Option<String>,
    pub bit_rate: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            width: 1280,
            height: 720,
            pixel_format: "yuv420p".to_string(),
            source: SourceKind::Screen,
            codec: None,
            bit_rate: 3_500_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in every frame handed to the encoder
    pub frame_samples: usize,
    /// Source selected at startup, `None` for silence only
    pub source: Option<SourceKind>,
    /// Fill the audio track with silence while no source is selected
    pub silence_when_idle: bool,
    pub system_gain: f32,
    pub microphone_gain: f32,
    pub codec: Option<String>,
    pub bit_rate: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_samples: 1024,
            source: Some(SourceKind::SystemAudio),
            silence_when_idle: true,
            system_gain: 1.0,
            microphone_gain: 1.0,
            codec: None,
            bit_rate: 128_000,
        }
    }
}

impl AudioConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(self.frame_samples as u64 * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

/// Device URL plus the demuxer that reads it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    pub format: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl SourceSpec {
    pub fn new(url: &str, format: &str) -> Self {
        Self {
            url: url.to_string(),
            format: format.to_string(),
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceTable {
    pub screen: SourceSpec,
    pub camera: SourceSpec,
    pub system_audio: SourceSpec,
    pub microphone: SourceSpec,
}

impl SourceTable {
    pub fn get(&self, kind: SourceKind) -> &SourceSpec {
        match kind {
            SourceKind::Screen => &self.screen,
            SourceKind::Camera => &self.camera,
            SourceKind::SystemAudio => &self.system_audio,
            SourceKind::Microphone => &self.microphone,
        }
    }
}

impl Default for SourceTable {
    fn default() -> Self {
        if cfg!(target_os = "windows") {
            Self {
                screen: SourceSpec::new("desktop", "gdigrab"),
                camera: SourceSpec::new("video=Integrated Camera", "dshow"),
                system_audio: SourceSpec::new("audio=virtual-audio-capturer", "dshow"),
                microphone: SourceSpec::new("audio=Microphone", "dshow"),
            }
        } else if cfg!(target_os = "macos") {
            Self {
                screen: SourceSpec::new("1:none", "avfoundation"),
                camera: SourceSpec::new("0:none", "avfoundation"),
                system_audio: SourceSpec::new("none:1", "avfoundation"),
                microphone: SourceSpec::new("none:0", "avfoundation"),
            }
        } else {
            Self {
                screen: SourceSpec::new(":0.0", "x11grab"),
                camera: SourceSpec::new("/dev/video0", "v4l2"),
                system_audio: SourceSpec::new("default", "pulse"),
                microphone: SourceSpec::new("default", "alsa"),
            }
        }
    }
}

/// Capacity of every queue role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// demux → decode
    pub packets: usize,
    /// decode → filter and filter → encode, video
    pub video_frames: usize,
    /// decode → mix and mix → encode, audio
    pub audio_frames: usize,
    /// encode → mux, per stream
    pub encoded: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            packets: 8,
            video_frames: 3,
            audio_frames: 30,
            encoded: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub queue_capacity: usize,
    pub pool_size: usize,
    /// Minimum recorded time between two progress notifications
    pub progress_interval_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 3,
            pool_size: 4,
            progress_interval_ms: 100,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
