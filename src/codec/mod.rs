//! Codec and container runtime seam
//!
//! The pipeline never decodes, encodes or writes containers itself; it drives
//! the collaborators defined here. [`synthetic`] provides a deterministic
//! in-process runtime, [`ffmpeg`] (cargo feature `ffmpeg`) the real one.

pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use crate::config::{AudioConfig, OutputConfig, SourceSpec, VideoConfig};
use crate::error::CodecError;
use crate::pipeline::types::{Frame, MediaKind, Packet, SourceKind, StreamParams, TimeBase};

/// A capture device or input stream, read by one demux stage
pub trait CaptureSource: Send {
    /// Parameters of the single stream this source yields
    fn stream_params(&self) -> StreamParams;

    /// Next compressed packet.
    ///
    /// `Again` when nothing is ready yet, `Eof` once the input ended.
    fn read_packet(&mut self) -> Result<Packet, CodecError>;

    fn close(&mut self) {}
}

/// Packet → frame transform with internal buffering
pub trait Decoder: Send {
    /// Feed one packet; `Again` means frames must be taken first
    fn push(&mut self, packet: Packet) -> Result<(), CodecError>;

    /// Signal end of input; buffered frames remain available through `take`
    fn flush(&mut self) -> Result<(), CodecError>;

    /// Next decoded frame: `Ok(None)` needs more input, `Err(Eof)` is drained
    fn take(&mut self) -> Result<Option<Frame>, CodecError>;

    /// Drop internal buffered state after a reinitialization
    fn reset(&mut self);
}

/// Frame → packet transform with internal buffering
pub trait Encoder: Send {
    /// Stream parameters to register with the muxer
    fn params(&self) -> StreamParams;

    fn push(&mut self, frame: Frame) -> Result<(), CodecError>;

    fn flush(&mut self) -> Result<(), CodecError>;

    fn take(&mut self) -> Result<Option<Packet>, CodecError>;
}

/// Per-frame conversion in the filter/mix stages (scale, format, resample)
pub trait FrameFilter: Send {
    /// Convert one frame; may buffer and return nothing yet
    fn push(&mut self, frame: Frame) -> Result<(), CodecError>;

    fn take(&mut self) -> Result<Option<Frame>, CodecError>;

    fn reset(&mut self) {}
}

/// Output container, driven by the [`Muxer`](crate::muxer::Muxer)
pub trait ContainerSink: Send {
    /// Register a stream; returns its index and the stream time base the
    /// container will use
    fn add_stream(&mut self, params: &StreamParams) -> Result<(usize, TimeBase), CodecError>;

    fn write_header(&mut self) -> Result<(), CodecError>;

    /// `packet` timestamps are already in the stream time base
    fn write_packet(&mut self, packet: Packet) -> Result<(), CodecError>;

    fn write_trailer(&mut self) -> Result<(), CodecError>;
}

/// Factory for every codec collaborator the recorder needs
pub trait CodecRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn open_source(&self, kind: SourceKind, spec: &SourceSpec) -> Result<Box<dyn CaptureSource>, CodecError>;

    fn open_decoder(&self, params: &StreamParams) -> Result<Box<dyn Decoder>, CodecError>;

    /// Converts decoded video into the encoder's size and pixel format
    fn open_video_filter(&self, config: &VideoConfig) -> Result<Box<dyn FrameFilter>, CodecError>;

    /// Converts decoded audio into the encoder's rate, layout and frame size
    fn open_audio_filter(&self, config: &AudioConfig) -> Result<Box<dyn FrameFilter>, CodecError>;

    /// `input` is the first frame's layout, `time_base` the stream clock's
    fn open_encoder(
        &self,
        kind: MediaKind,
        input: &Frame,
        time_base: TimeBase,
        video: &VideoConfig,
        audio: &AudioConfig,
    ) -> Result<Box<dyn Encoder>, CodecError>;

    fn open_sink(&self, output: &OutputConfig) -> Result<Box<dyn ContainerSink>, CodecError>;
}

/// Passes frames through untouched
#[derive(Debug, Default)]
pub struct PassthroughFilter {
    pending: Option<Frame>,
}

impl FrameFilter for PassthroughFilter {
    fn push(&mut self, frame: Frame) -> Result<(), CodecError> {
        if self.pending.is_some() {
            return Err(CodecError::Again);
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
