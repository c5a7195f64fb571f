//! One live capture source: demux → decode

use crate::codec::CodecRuntime;
use crate::config::{QueueConfig, SourceSpec};
use crate::error::StageError;
use crate::pipeline::decode::DecodeWorker;
use crate::pipeline::demux::DemuxWorker;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{shutdown, PipelineStage, StageThread};
use crate::pipeline::types::{MediaKind, SourceKind, StreamParams};
use crate::queue::{FrameQueue, PacketQueue, Wakeable};
use anyhow::Context;
use log::info;
use std::sync::Arc;

/// Queues of one source, kept across reopenings so their serial keeps counting
#[derive(Clone)]
pub struct SourceQueues {
    pub packets: Arc<PacketQueue>,
    pub frames: Arc<FrameQueue>,
}

impl SourceQueues {
    pub fn new(kind: SourceKind, config: &QueueConfig) -> Self {
        let frames = match kind.media() {
            MediaKind::Video => config.video_frames,
            MediaKind::Audio => config.audio_frames,
        };
        Self {
            packets: Arc::new(PacketQueue::new(format!("{}-packets", kind), config.packets)),
            frames: Arc::new(FrameQueue::new(format!("{}-frames", kind), frames)),
        }
    }
}

pub struct SourceChain {
    kind: SourceKind,
    params: StreamParams,
    queues: SourceQueues,
    demux: StageThread<DemuxWorker>,
    decode: StageThread<DecodeWorker>,
}

impl SourceChain {
    /// Open the device and its decoder; nothing runs until [`start`](Self::start)
    pub fn open(
        kind: SourceKind,
        spec: &SourceSpec,
        runtime: &dyn CodecRuntime,
        queues: &SourceQueues,
        health: &Arc<PipelineHealth>,
    ) -> anyhow::Result<Self> {
        let source = runtime
            .open_source(kind, spec)
            .with_context(|| format!("opening {} source {}", kind, spec.url))?;
        let params = source.stream_params();
        let decoder = runtime
            .open_decoder(&params)
            .with_context(|| format!("opening {} decoder for {}", params.codec, kind))?;

        let demux = StageThread::new(
            format!("DemuxStage[{}]", kind),
            DemuxWorker::new(
                format!("DemuxStage[{}]", kind),
                source,
                Arc::clone(&queues.packets),
                Arc::clone(health),
            ),
            vec![Arc::clone(&queues.packets) as Arc<dyn Wakeable>],
        );
        let decode = StageThread::new(
            format!("DecodeStage[{}]", kind),
            DecodeWorker::new(
                format!("DecodeStage[{}]", kind),
                Arc::clone(&queues.packets),
                Arc::clone(&queues.frames),
                decoder,
                Arc::clone(health),
            ),
            vec![
                Arc::clone(&queues.packets) as Arc<dyn Wakeable>,
                Arc::clone(&queues.frames) as Arc<dyn Wakeable>,
            ],
        );

        Ok(Self {
            kind,
            params,
            queues: queues.clone(),
            demux,
            decode,
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn frames(&self) -> &Arc<FrameQueue> {
        &self.queues.frames
    }

    /// Discard leftovers of the previous epoch, then run decode and demux
    pub fn start(&self) -> Result<(), StageError> {
        let dropped = self.queues.packets.clear() + self.queues.frames.clear();
        self.queues.packets.start();
        self.queues.frames.start();
        self.queues.packets.enqueue_flush();
        info!(
            "SourceChain[{}]: starting at serial {} ({} stale items dropped)",
            self.kind,
            self.queues.packets.serial(),
            dropped
        );
        self.decode.start()?;
        self.demux.start()
    }

    /// Ask the source to end; EOF then flows through the whole pipeline
    pub fn drain(&self) -> Result<(), StageError> {
        self.demux.drain()
    }

    /// `stop → wake → wait → close`, downstream stage first
    pub fn shutdown(&self) -> Result<(), StageError> {
        let result = shutdown(&[&self.decode, &self.demux]);
        self.queues.packets.close();
        self.queues.frames.close();
        result
    }

    pub fn is_running(&self) -> bool {
        self.demux.state().is_active() || self.decode.state().is_active()
    }
}
