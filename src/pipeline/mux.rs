//! Mux stage: interleaves the two encoded packet queues into the container

use crate::error::{CodecError, MuxError};
use crate::muxer::{Interleaver, Muxer, Pick, SyncPolicy};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Flow, StageWorker};
use crate::pipeline::state::StageControl;
use crate::pipeline::types::{MediaKind, Packet};
use crate::queue::{PacketQueue, QueueItem};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::INPUT_WAIT;

/// Called from the mux thread with the recorded (video) time so far
pub type ProgressHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// One side of the interleaver: its queue, the pending packet, EOF flag
struct Lane {
    kind: MediaKind,
    input: Arc<PacketQueue>,
    pending: Option<Packet>,
    done: bool,
}

enum Refill {
    Ready,
    /// The queue is stopped while the stage still runs
    Unavailable,
}

impl Lane {
    fn new(kind: MediaKind, input: Arc<PacketQueue>) -> Self {
        Self {
            kind,
            input,
            pending: None,
            done: false,
        }
    }

    fn needs_refill(&self) -> bool {
        self.pending.is_none() && !self.done
    }

    /// Block until this lane has a packet with a timestamp or reached EOF
    fn refill(&mut self, health: &PipelineHealth) -> Refill {
        while self.needs_refill() {
            let Some(envelope) = self.input.dequeue() else {
                return Refill::Unavailable;
            };
            if envelope.serial != self.input.serial() {
                health.record_stale_discard();
                continue;
            }
            match envelope.item {
                QueueItem::Item(packet) if packet.pts.is_none() => {
                    health.record_invalid_timestamp();
                }
                QueueItem::Item(packet) => self.pending = Some(packet),
                QueueItem::Flush => {}
                QueueItem::Eof => {
                    info!("MuxStage: {} stream reached EOF", self.kind);
                    self.done = true;
                }
            }
        }
        Refill::Ready
    }

    fn pending_micros(&self) -> Option<i64> {
        self.pending.as_ref().and_then(|p| p.pts_micros())
    }

    fn reset(&mut self) {
        self.pending = None;
        self.done = false;
    }
}

pub struct MuxWorker {
    muxer: Arc<Muxer>,
    audio: Lane,
    video: Lane,
    interleaver: Interleaver,
    health: Arc<PipelineHealth>,
    header_written: bool,
    progress: Option<ProgressHook>,
    progress_interval_us: i64,
    last_progress_us: Option<i64>,
}

impl MuxWorker {
    pub fn new(
        muxer: Arc<Muxer>,
        audio: Arc<PacketQueue>,
        video: Arc<PacketQueue>,
        policy: SyncPolicy,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            muxer,
            audio: Lane::new(MediaKind::Audio, audio),
            video: Lane::new(MediaKind::Video, video),
            interleaver: Interleaver::new(policy),
            health,
            header_written: false,
            progress: None,
            progress_interval_us: 100_000,
            last_progress_us: None,
        }
    }

    pub fn with_progress(mut self, hook: ProgressHook, interval: Duration) -> Self {
        self.progress = Some(hook);
        self.progress_interval_us = interval.as_micros().min(i64::MAX as u128) as i64;
        self
    }

    fn report_progress(&mut self, video_us: i64) {
        let Some(hook) = &self.progress else {
            return;
        };
        let due = match self.last_progress_us {
            Some(last) => video_us - last >= self.progress_interval_us,
            None => true,
        };
        if due {
            self.last_progress_us = Some(video_us);
            hook(Duration::from_micros(video_us.max(0) as u64));
        }
    }

    /// Write one packet; `Err` only for errors that end the stage
    fn write(&mut self, packet: Packet) -> Result<(), MuxError> {
        let kind = packet.kind;
        let pts_us = packet.pts_micros();
        match self.muxer.mux(packet) {
            Ok(true) => {
                if let (MediaKind::Video, Some(us)) = (kind, pts_us) {
                    self.report_progress(us);
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e @ MuxError::Codec(CodecError::Fatal(_))) | Err(e @ MuxError::NoSink) => Err(e),
            Err(e) => {
                warn!("MuxStage: {} packet dropped: {}", kind, e);
                Ok(())
            }
        }
    }

    fn next_packet(&mut self) -> Option<Packet> {
        let pick = match (self.audio.pending_micros(), self.video.pending_micros()) {
            (Some(a), Some(v)) => self.interleaver.pick(a, v),
            (Some(_), None) => Pick::Audio,
            (None, Some(_)) => Pick::Video,
            (None, None) => return None,
        };
        match pick {
            Pick::Audio => self.audio.pending.take(),
            Pick::Video => self.video.pending.take(),
        }
    }
}

impl StageWorker for MuxWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        if !self.header_written {
            match self.muxer.write_header() {
                Ok(()) => self.header_written = true,
                Err(MuxError::Stopped) => return Flow::Finished,
                Err(e) => {
                    error!("MuxStage: header failed: {}", e);
                    self.health.record_codec_failure();
                    return Flow::Finished;
                }
            }
        }

        for lane in [&mut self.audio, &mut self.video] {
            if let Refill::Unavailable = lane.refill(&self.health) {
                if control.is_active() {
                    lane.input.wait_started(INPUT_WAIT);
                }
                return Flow::Continue;
            }
        }

        let Some(packet) = self.next_packet() else {
            // Both lanes reached EOF
            debug!("MuxStage: all streams drained");
            return Flow::Finished;
        };
        match self.write(packet) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!("MuxStage: write failed: {}", e);
                self.health.record_codec_failure();
                Flow::Finished
            }
        }
    }

    fn on_exit(&mut self) {
        match self.muxer.write_trailer() {
            Ok(true) => info!("MuxStage: container finalized"),
            Ok(false) => {}
            Err(e) => error!("MuxStage: trailer failed: {}", e),
        }
    }

    fn close(&mut self) {
        self.audio.reset();
        self.video.reset();
        self.interleaver.reset();
        self.header_written = false;
        self.last_progress_us = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::synthetic::{MemorySink, SinkProbe};
    use crate::pipeline::stage::{shutdown, PipelineStage, StageThread};
    use crate::pipeline::types::{StreamParams, TimeBase};
    use crate::queue::Wakeable;
    use bytes::Bytes;
    use parking_lot::Mutex;

    const MS: TimeBase = TimeBase::new(1, 1000);

    struct Harness {
        stage: StageThread<MuxWorker>,
        audio: Arc<PacketQueue>,
        video: Arc<PacketQueue>,
        probe: SinkProbe,
    }

    fn mux_stage(policy: SyncPolicy, progress: Option<ProgressHook>) -> Harness {
        let health = Arc::new(PipelineHealth::new());
        let muxer = Arc::new(Muxer::new(Arc::clone(&health)));
        let probe = SinkProbe::default();
        muxer.open(Box::new(MemorySink::new(probe.clone())));
        muxer
            .add_stream(&StreamParams::audio("aac", 48_000, 2, MS))
            .unwrap();
        muxer
            .add_stream(&StreamParams::video("h264", 64, 64, MS))
            .unwrap();

        let audio = Arc::new(PacketQueue::new("audio packets", 16));
        let video = Arc::new(PacketQueue::new("video packets", 16));
        let mut worker = MuxWorker::new(
            Arc::clone(&muxer),
            Arc::clone(&audio),
            Arc::clone(&video),
            policy,
            health,
        );
        if let Some(hook) = progress {
            worker = worker.with_progress(hook, Duration::from_millis(20));
        }
        let stage = StageThread::new(
            "MuxStage",
            worker,
            vec![
                Arc::clone(&muxer) as Arc<dyn Wakeable>,
                Arc::clone(&audio) as Arc<dyn Wakeable>,
                Arc::clone(&video) as Arc<dyn Wakeable>,
            ],
        );
        Harness {
            stage,
            audio,
            video,
            probe,
        }
    }

    fn feed(queue: &PacketQueue, kind: MediaKind, pts: &[i64]) {
        for &ms in pts {
            queue.enqueue(Packet::new(kind, Bytes::from_static(b"x"), Some(ms), MS));
        }
        queue.enqueue_eof();
    }

    fn wait_finished(stage: &StageThread<MuxWorker>) {
        for _ in 0..200 {
            if stage.is_finished() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("mux stage did not finish");
    }

    fn written_order(probe: &SinkProbe) -> Vec<String> {
        // Container time bases: audio 1/1000 as registered, video 1/90000
        probe
            .snapshot()
            .packets
            .iter()
            .map(|p| match p.kind {
                MediaKind::Audio => format!("A{}", p.pts.unwrap()),
                MediaKind::Video => format!("V{}", p.pts.unwrap() / 90),
            })
            .collect()
    }

    #[test]
    fn test_reference_interleave_order() {
        let h = mux_stage(SyncPolicy::default(), None);
        feed(&h.audio, MediaKind::Audio, &[0, 10, 20, 30]);
        feed(&h.video, MediaKind::Video, &[0, 16, 33, 50]);
        h.stage.start().unwrap();
        wait_finished(&h.stage);
        shutdown(&[&h.stage]).unwrap();

        assert_eq!(
            written_order(&h.probe),
            ["A0", "V0", "A10", "V16", "A20", "A30", "V33", "V50"]
        );
        let report = h.probe.snapshot();
        assert_eq!(report.headers_written, 1);
        assert_eq!(report.trailers_written, 1);
    }

    #[test]
    fn test_adaptive_interleave_order() {
        let h = mux_stage(SyncPolicy::Adaptive { max_ms: 33, window: 16 }, None);
        feed(&h.audio, MediaKind::Audio, &[0, 10, 20, 30]);
        feed(&h.video, MediaKind::Video, &[0, 16, 33, 50]);
        h.stage.start().unwrap();
        wait_finished(&h.stage);
        shutdown(&[&h.stage]).unwrap();

        assert_eq!(
            written_order(&h.probe),
            ["A0", "V0", "A10", "A20", "V16", "A30", "V33", "V50"]
        );
    }

    #[test]
    fn test_remaining_stream_drained_after_eof() {
        let h = mux_stage(SyncPolicy::default(), None);
        feed(&h.audio, MediaKind::Audio, &[]);
        feed(&h.video, MediaKind::Video, &[0, 33, 66]);
        h.stage.start().unwrap();
        wait_finished(&h.stage);
        shutdown(&[&h.stage]).unwrap();
        assert_eq!(written_order(&h.probe), ["V0", "V33", "V66"]);
        assert_eq!(h.probe.snapshot().trailers_written, 1);
    }

    #[test]
    fn test_external_stop_writes_trailer_once() {
        let h = mux_stage(SyncPolicy::default(), None);
        h.audio.enqueue(Packet::new(MediaKind::Audio, Bytes::new(), Some(0), MS));
        h.stage.start().unwrap();
        // Blocked waiting for the first video packet
        std::thread::sleep(Duration::from_millis(30));
        shutdown(&[&h.stage]).unwrap();
        let report = h.probe.snapshot();
        assert_eq!(report.headers_written, 1);
        assert_eq!(report.trailers_written, 1);
        assert!(report.packets.is_empty());
    }

    #[test]
    fn test_progress_reported_on_video_time() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook: ProgressHook = {
            let seen = Arc::clone(&seen);
            Arc::new(move |elapsed| seen.lock().push(elapsed.as_millis()))
        };
        let h = mux_stage(SyncPolicy::default(), Some(hook));
        feed(&h.audio, MediaKind::Audio, &[]);
        feed(&h.video, MediaKind::Video, &[0, 10, 20, 30, 40, 50]);
        h.stage.start().unwrap();
        wait_finished(&h.stage);
        shutdown(&[&h.stage]).unwrap();
        assert_eq!(*seen.lock(), vec![0, 20, 40]);
    }
}
