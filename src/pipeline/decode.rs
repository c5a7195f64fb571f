//! Decode stage: packet queue → frame queue

use crate::codec::Decoder;
use crate::error::CodecError;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Flow, StageWorker};
use crate::pipeline::state::StageControl;
use crate::pipeline::types::Packet;
use crate::queue::{FrameQueue, PacketQueue, QueueItem};
use log::{debug, error, info};
use std::sync::Arc;

use super::INPUT_WAIT;

pub struct DecodeWorker {
    name: String,
    input: Arc<PacketQueue>,
    output: Arc<FrameQueue>,
    decoder: Box<dyn Decoder>,
    health: Arc<PipelineHealth>,
    /// Serial of the last packet fed to the decoder
    serial: u64,
}

impl DecodeWorker {
    pub fn new(
        name: impl Into<String>,
        input: Arc<PacketQueue>,
        output: Arc<FrameQueue>,
        decoder: Box<dyn Decoder>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        let serial = input.serial();
        Self {
            name: name.into(),
            input,
            output,
            decoder,
            health,
            serial,
        }
    }

    /// Move every frame the decoder has ready downstream; returns how many
    fn forward_frames(&mut self) -> Result<usize, CodecError> {
        let mut forwarded = 0;
        loop {
            match self.decoder.take() {
                Ok(Some(frame)) => {
                    if !self.output.enqueue(frame) {
                        self.health.record_frame_drop();
                    }
                    forwarded += 1;
                }
                Ok(None) | Err(CodecError::Again) | Err(CodecError::Eof) => return Ok(forwarded),
                Err(e) => return Err(e),
            }
        }
    }

    fn decode(&mut self, packet: Packet) -> Result<(), CodecError> {
        // Take ready frames first; `Again` after that is a real stall
        self.forward_frames()?;
        match self.decoder.push(packet) {
            Ok(()) => {
                self.forward_frames()?;
            }
            Err(CodecError::Again) => {
                debug!("{}: decoder stalled, packet dropped", self.name);
                self.health.record_frame_drop();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn drain(&mut self) -> Flow {
        if let Err(e) = self.decoder.flush().and_then(|_| self.forward_frames().map(|_| ())) {
            error!("{}: flush failed: {}", self.name, e);
            self.health.record_codec_failure();
        }
        self.output.enqueue_eof();
        Flow::Finished
    }

    fn reset(&mut self, serial: u64) {
        debug!("{}: reset for serial {}", self.name, serial);
        self.decoder.reset();
        self.serial = serial;
    }
}

impl StageWorker for DecodeWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        let Some(envelope) = self.input.dequeue() else {
            if control.is_active() {
                self.input.wait_started(INPUT_WAIT);
            }
            return Flow::Continue;
        };

        if envelope.serial != self.input.serial() {
            self.health.record_stale_discard();
            if envelope.serial != self.serial {
                self.reset(envelope.serial);
            }
            return Flow::Continue;
        }

        match envelope.item {
            QueueItem::Flush => {
                self.reset(envelope.serial);
                self.output.enqueue_flush();
                Flow::Continue
            }
            QueueItem::Eof => {
                info!("{}: end of stream", self.name);
                self.drain()
            }
            QueueItem::Item(packet) => {
                if envelope.serial != self.serial {
                    self.reset(envelope.serial);
                }
                match self.decode(packet) {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        error!("{}: decode failed: {}", self.name, e);
                        self.health.record_codec_failure();
                        self.output.enqueue_eof();
                        Flow::Finished
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        self.decoder.reset();
        self.serial = self.input.serial();
    }
}
