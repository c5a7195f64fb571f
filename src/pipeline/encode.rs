//! Encode stage: frame queue → stream clock → encoder → encoded packet queue

use crate::codec::{CodecRuntime, Encoder};
use crate::config::{AudioConfig, VideoConfig};
use crate::error::CodecError;
use crate::muxer::Muxer;
use crate::pipeline::clock::StreamClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Flow, StageWorker};
use crate::pipeline::state::StageControl;
use crate::pipeline::types::{Frame, MediaKind};
use crate::queue::{FrameQueue, PacketQueue, QueueItem};
use log::{debug, error, info, trace};
use std::sync::Arc;
use std::time::Instant;

use super::INPUT_WAIT;

pub struct EncodeWorker {
    name: String,
    kind: MediaKind,
    input: Arc<FrameQueue>,
    output: Arc<PacketQueue>,
    runtime: Arc<dyn CodecRuntime>,
    video: VideoConfig,
    audio: AudioConfig,
    clock: Arc<StreamClock>,
    muxer: Arc<Muxer>,
    health: Arc<PipelineHealth>,
    /// Opened on the first stamped frame
    encoder: Option<Box<dyn Encoder>>,
}

impl EncodeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: MediaKind,
        input: Arc<FrameQueue>,
        output: Arc<PacketQueue>,
        runtime: Arc<dyn CodecRuntime>,
        video: VideoConfig,
        audio: AudioConfig,
        clock: Arc<StreamClock>,
        muxer: Arc<Muxer>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            name: format!("EncodeStage[{}]", kind),
            kind,
            input,
            output,
            runtime,
            video,
            audio,
            clock,
            muxer,
            health,
            encoder: None,
        }
    }

    fn advance(&self, frame: &Frame) -> i64 {
        match self.kind {
            MediaKind::Video => 1,
            MediaKind::Audio => frame.nb_samples as i64,
        }
    }

    fn open_encoder(&mut self, first: &Frame) -> Result<(), CodecError> {
        let encoder = self.runtime.open_encoder(
            self.kind,
            first,
            self.clock.time_base(),
            &self.video,
            &self.audio,
        )?;
        let params = encoder.params();
        let index = self
            .muxer
            .add_stream(&params)
            .map_err(|e| CodecError::fatal(format!("registering stream: {}", e)))?;
        info!(
            "{}: opened {} encoder, stream #{} ({})",
            self.name, params.codec, index, params.time_base
        );
        self.encoder = Some(encoder);
        Ok(())
    }

    fn forward_packets(&mut self) -> Result<usize, CodecError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(0);
        };
        let mut forwarded = 0;
        loop {
            match encoder.take() {
                Ok(Some(packet)) => {
                    if !self.output.enqueue(packet) {
                        trace!("{}: mux queue stopped, packet released", self.name);
                    }
                    forwarded += 1;
                }
                Ok(None) | Err(CodecError::Again) | Err(CodecError::Eof) => return Ok(forwarded),
                Err(e) => return Err(e),
            }
        }
    }

    fn encode(&mut self, frame: Frame) -> Result<(), CodecError> {
        let advance = self.advance(&frame);
        let Some(stamp) = self.clock.stamp(Instant::now(), advance) else {
            // Paused, or recording not started
            self.health.record_frame_drop();
            return Ok(());
        };
        let mut frame = frame.with_pts(stamp.pts, self.clock.time_base());
        frame.force_keyframe |= stamp.force_keyframe;

        if self.encoder.is_none() {
            self.open_encoder(&frame)?;
        }

        // Take ready packets first; `Again` after that is a real stall
        self.forward_packets()?;
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        match encoder.push(frame) {
            Ok(()) => {
                self.health.record_frame();
                self.forward_packets()?;
            }
            Err(CodecError::Again) => {
                debug!("{}: encoder stalled, frame dropped", self.name);
                self.health.record_frame_drop();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn drain(&mut self) -> Flow {
        if let Some(encoder) = self.encoder.as_mut() {
            let flushed = encoder.flush();
            if let Err(e) = flushed.and_then(|_| self.forward_packets()) {
                error!("{}: flush failed: {}", self.name, e);
                self.health.record_codec_failure();
            }
        }
        self.output.enqueue_eof();
        Flow::Finished
    }
}

impl StageWorker for EncodeWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        let Some(envelope) = self.input.dequeue() else {
            if control.is_active() {
                self.input.wait_started(INPUT_WAIT);
            }
            return Flow::Continue;
        };
        if envelope.serial != self.input.serial() {
            self.health.record_stale_discard();
            return Flow::Continue;
        }

        match envelope.item {
            QueueItem::Flush => Flow::Continue,
            QueueItem::Eof => {
                info!("{}: end of stream", self.name);
                self.drain()
            }
            QueueItem::Item(frame) => match self.encode(frame) {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    error!("{}: encode failed: {}", self.name, e);
                    self.health.record_codec_failure();
                    self.output.enqueue_eof();
                    Flow::Finished
                }
            },
        }
    }

    /// The next start opens a fresh encoder and rebinds the muxer stream
    fn close(&mut self) {
        if self.encoder.take().is_some() {
            debug!("{}: encoder released", self.name);
        }
    }
}
