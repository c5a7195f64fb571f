//! Demux stage: capture source → packet queue

use crate::codec::CaptureSource;
use crate::error::CodecError;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Flow, StageWorker};
use crate::pipeline::state::StageControl;
use crate::queue::PacketQueue;
use log::{error, info, trace};
use std::sync::Arc;
use std::time::Duration;

use super::INPUT_WAIT;

/// Pause between two reads when the source has nothing ready
const RETRY_DELAY: Duration = Duration::from_millis(2);

pub struct DemuxWorker {
    name: String,
    source: Box<dyn CaptureSource>,
    output: Arc<PacketQueue>,
    health: Arc<PipelineHealth>,
    packets: u64,
}

impl DemuxWorker {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn CaptureSource>,
        output: Arc<PacketQueue>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            output,
            health,
            packets: 0,
        }
    }

    fn end_of_stream(&self) -> Flow {
        self.output.enqueue_eof();
        Flow::Finished
    }
}

impl StageWorker for DemuxWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        if control.is_draining() {
            info!("{}: draining after {} packets", self.name, self.packets);
            return self.end_of_stream();
        }

        match self.source.read_packet() {
            Ok(packet) => {
                if self.output.enqueue(packet) {
                    self.packets += 1;
                } else if control.is_running() {
                    // Downstream is being reinitialized
                    trace!("{}: output stopped, packet released", self.name);
                    self.output.wait_started(INPUT_WAIT);
                }
                Flow::Continue
            }
            Err(CodecError::Again) => {
                std::thread::sleep(RETRY_DELAY);
                Flow::Continue
            }
            Err(CodecError::Eof) => {
                info!("{}: end of input after {} packets", self.name, self.packets);
                self.end_of_stream()
            }
            Err(CodecError::Fatal(e)) => {
                error!("{}: read failed: {}", self.name, e);
                self.health.record_codec_failure();
                self.end_of_stream()
            }
        }
    }

    fn close(&mut self) {
        self.source.close();
        self.packets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::synthetic::{SyntheticOptions, SyntheticSource};
    use crate::pipeline::stage::{shutdown, PipelineStage, StageThread};
    use crate::pipeline::types::SourceKind;
    use crate::queue::{QueueItem, Wakeable};

    fn demux(options: SyntheticOptions) -> (StageThread<DemuxWorker>, Arc<PacketQueue>, Arc<PipelineHealth>) {
        let output = Arc::new(PacketQueue::new("packets", 8));
        let health = Arc::new(PipelineHealth::new());
        let worker = DemuxWorker::new(
            "DemuxStage[screen]",
            Box::new(SyntheticSource::new(SourceKind::Screen, &options)),
            Arc::clone(&output),
            Arc::clone(&health),
        );
        let stage = StageThread::new(
            "DemuxStage[screen]",
            worker,
            vec![Arc::clone(&output) as Arc<dyn Wakeable>],
        );
        (stage, output, health)
    }

    fn collect(queue: &PacketQueue) -> (usize, bool) {
        let mut packets = 0;
        while let Some(envelope) = queue.dequeue_timeout(Duration::from_secs(2)) {
            match envelope.item {
                QueueItem::Item(_) => packets += 1,
                QueueItem::Eof => return (packets, true),
                QueueItem::Flush => {}
            }
        }
        (packets, false)
    }

    #[test]
    fn test_source_eof_forwarded() {
        let (stage, output, _) = demux(SyntheticOptions {
            fps: 200,
            packet_limit: Some(5),
            ..SyntheticOptions::default()
        });
        stage.start().unwrap();
        assert_eq!(collect(&output), (5, true));
        shutdown(&[&stage]).unwrap();
    }

    #[test]
    fn test_fatal_error_ends_stage_with_eof() {
        let (stage, output, health) = demux(SyntheticOptions {
            fail_after: Some(2),
            fps: 200,
            ..SyntheticOptions::default()
        });
        stage.start().unwrap();
        assert_eq!(collect(&output), (2, true));
        assert_eq!(health.summary().codec_failures, 1);
        shutdown(&[&stage]).unwrap();
    }

    #[test]
    fn test_teardown_does_not_inject_eof() {
        let (stage, output, _) = demux(SyntheticOptions {
            fps: 200,
            ..SyntheticOptions::default()
        });
        stage.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        shutdown(&[&stage]).unwrap();

        output.start();
        let mut saw_eof = false;
        while let Some(envelope) = output.try_dequeue() {
            saw_eof |= envelope.is_eof();
        }
        assert!(!saw_eof);
    }
}
