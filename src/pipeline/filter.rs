//! Filter (video) and mix (audio) stages
//!
//! Both pull from whichever source the [`SourceSelector`] currently points at,
//! run the runtime's conversion filter and feed the encoder queue. Frames are
//! dropped until the recorder starts recording.

use crate::codec::FrameFilter;
use crate::config::AudioConfig;
use crate::error::CodecError;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::selector::SourceSelector;
use crate::pipeline::stage::{Flow, StageWorker};
use crate::pipeline::state::StageControl;
use crate::pipeline::types::{Frame, FrameFormat, SourceKind};
use crate::queue::{FrameQueue, QueueItem};
use bytes::{BufMut, BytesMut};
use log::{debug, error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::INPUT_WAIT;

/// Silence frames owed after a stall beyond which the generator resyncs
const MAX_SILENCE_BACKLOG: u32 = 4;

enum Pulled {
    Frame(SourceKind, Frame),
    /// No source selected
    Unselected,
    /// Nothing usable this iteration
    Pending,
    Eof,
}

/// State shared by both filter roles
struct FilterCore {
    name: String,
    selector: Arc<SourceSelector>,
    filter: Box<dyn FrameFilter>,
    output: Arc<FrameQueue>,
    recording: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
    source: Option<SourceKind>,
}

impl FilterCore {
    fn pull(&mut self) -> Pulled {
        let Some((kind, input)) = self.selector.current() else {
            self.source = None;
            return Pulled::Unselected;
        };
        if self.source != Some(kind) {
            debug!("{}: now reading {}", self.name, kind);
            self.filter.reset();
            self.source = Some(kind);
        }

        // Bounded wait: the selection may change under us
        let Some(envelope) = input.dequeue_timeout(INPUT_WAIT) else {
            if input.is_stopped() {
                input.wait_started(INPUT_WAIT);
            }
            return Pulled::Pending;
        };
        if envelope.serial != input.serial() {
            self.health.record_stale_discard();
            return Pulled::Pending;
        }
        match envelope.item {
            QueueItem::Item(frame) => Pulled::Frame(kind, frame),
            QueueItem::Flush => {
                self.filter.reset();
                Pulled::Pending
            }
            QueueItem::Eof => Pulled::Eof,
        }
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn run(&mut self, frame: Frame, mut post: impl FnMut(Frame) -> Frame) -> Result<(), CodecError> {
        self.forward(&mut post)?;
        match self.filter.push(frame) {
            Ok(()) => {}
            Err(CodecError::Again) => self.health.record_frame_drop(),
            Err(e) => return Err(e),
        }
        self.forward(&mut post)
    }

    fn forward(&mut self, post: &mut impl FnMut(Frame) -> Frame) -> Result<(), CodecError> {
        loop {
            match self.filter.take() {
                Ok(Some(frame)) => {
                    if !self.output.enqueue(post(frame)) {
                        self.health.record_frame_drop();
                    }
                }
                Ok(None) | Err(CodecError::Again) | Err(CodecError::Eof) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn handle(&mut self, frame: Frame, post: impl FnMut(Frame) -> Frame) -> Flow {
        if !self.is_recording() {
            return Flow::Continue;
        }
        match self.run(frame, post) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!("{}: filter failed: {}", self.name, e);
                self.health.record_codec_failure();
                self.finish()
            }
        }
    }

    fn finish(&mut self) -> Flow {
        info!("{}: end of stream", self.name);
        self.output.enqueue_eof();
        Flow::Finished
    }
}

/// Video select + scale stage
pub struct VideoFilterWorker {
    core: FilterCore,
}

impl VideoFilterWorker {
    pub fn new(
        selector: Arc<SourceSelector>,
        filter: Box<dyn FrameFilter>,
        output: Arc<FrameQueue>,
        recording: Arc<AtomicBool>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            core: FilterCore {
                name: "FilterStage[video]".to_string(),
                selector,
                filter,
                output,
                recording,
                health,
                source: None,
            },
        }
    }
}

impl StageWorker for VideoFilterWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        match self.core.pull() {
            Pulled::Unselected => {
                if control.is_draining() {
                    return self.core.finish();
                }
                self.core.selector.wait_for_input(INPUT_WAIT);
                Flow::Continue
            }
            Pulled::Pending => Flow::Continue,
            Pulled::Eof => self.core.finish(),
            Pulled::Frame(_, frame) => self.core.handle(frame, |f| f),
        }
    }

    fn close(&mut self) {
        self.core.filter.reset();
        self.core.source = None;
    }
}

/// Per-source linear gain on interleaved f32 samples
#[derive(Debug, Clone, Copy)]
pub struct AudioGains {
    pub system: f32,
    pub microphone: f32,
}

impl AudioGains {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            system: config.system_gain,
            microphone: config.microphone_gain,
        }
    }

    pub fn gain(&self, kind: SourceKind) -> f32 {
        match kind {
            SourceKind::Microphone => self.microphone,
            _ => self.system,
        }
    }
}

/// Scale `frame` by `gain`; only packed `flt` buffers are touched
pub fn apply_gain(mut frame: Frame, gain: f32) -> Frame {
    let is_float = matches!(&frame.format, FrameFormat::Audio { sample_format, .. } if sample_format == "flt");
    if !is_float || (gain - 1.0).abs() < f32::EPSILON {
        return frame;
    }
    let mut out = BytesMut::with_capacity(frame.data.len());
    for sample in frame.data.chunks_exact(4) {
        let value = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
        out.put_f32_le((value * gain).clamp(-1.0, 1.0));
    }
    frame.data = out.freeze();
    frame
}

struct SilenceGenerator {
    sample_rate: u32,
    channels: u16,
    frame_samples: usize,
    frame_duration: Duration,
    next_due: Option<Instant>,
}

/// Audio select + resample + gain stage, with silence fill
pub struct AudioMixWorker {
    core: FilterCore,
    gains: AudioGains,
    silence: Option<SilenceGenerator>,
}

impl AudioMixWorker {
    pub fn new(
        config: &AudioConfig,
        selector: Arc<SourceSelector>,
        filter: Box<dyn FrameFilter>,
        output: Arc<FrameQueue>,
        recording: Arc<AtomicBool>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        let silence = config.silence_when_idle.then(|| SilenceGenerator {
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_samples: config.frame_samples,
            frame_duration: config.frame_duration(),
            next_due: None,
        });
        Self {
            core: FilterCore {
                name: "MixStage[audio]".to_string(),
                selector,
                filter,
                output,
                recording,
                health,
                source: None,
            },
            gains: AudioGains::from_config(config),
            silence,
        }
    }

    /// Emit one silence frame when due, otherwise wait for it or a selection
    fn fill_silence(&mut self) {
        let Some(silence) = self.silence.as_mut() else {
            self.core.selector.wait_for_input(INPUT_WAIT);
            return;
        };
        let now = Instant::now();
        let mut due = *silence.next_due.get_or_insert(now);
        if now < due {
            self.core.selector.wait_for_input(due - now);
            return;
        }
        if now.duration_since(due) > silence.frame_duration * MAX_SILENCE_BACKLOG {
            due = now;
        }
        silence.next_due = Some(due + silence.frame_duration);

        if self.core.is_recording() {
            let frame = Frame::silence(silence.sample_rate, silence.channels, silence.frame_samples);
            if !self.core.output.enqueue(frame) {
                self.core.health.record_frame_drop();
            }
        }
    }
}

impl StageWorker for AudioMixWorker {
    fn step(&mut self, control: &StageControl) -> Flow {
        match self.core.pull() {
            Pulled::Unselected => {
                if control.is_draining() {
                    return self.core.finish();
                }
                self.fill_silence();
                Flow::Continue
            }
            Pulled::Pending => Flow::Continue,
            Pulled::Eof => self.core.finish(),
            Pulled::Frame(kind, frame) => {
                if let Some(silence) = self.silence.as_mut() {
                    silence.next_due = None;
                }
                let gain = self.gains.gain(kind);
                self.core.handle(frame, |f| apply_gain(f, gain))
            }
        }
    }

    fn close(&mut self) {
        self.core.filter.reset();
        self.core.source = None;
        if let Some(silence) = self.silence.as_mut() {
            silence.next_due = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PassthroughFilter;
    use crate::pipeline::stage::{shutdown, PipelineStage, StageThread};
    use crate::pipeline::types::{MediaKind, TimeBase};
    use crate::queue::Wakeable;
    use bytes::Bytes;

    struct Harness {
        selector: Arc<SourceSelector>,
        output: Arc<FrameQueue>,
        recording: Arc<AtomicBool>,
        health: Arc<PipelineHealth>,
    }

    impl Harness {
        fn new(media: MediaKind) -> Self {
            Self {
                selector: Arc::new(SourceSelector::new(media)),
                output: Arc::new(FrameQueue::new("filtered", 64)),
                recording: Arc::new(AtomicBool::new(true)),
                health: Arc::new(PipelineHealth::new()),
            }
        }

        fn wakers(&self) -> Vec<Arc<dyn Wakeable>> {
            vec![
                Arc::clone(&self.selector) as Arc<dyn Wakeable>,
                Arc::clone(&self.output) as Arc<dyn Wakeable>,
            ]
        }
    }

    fn float_frame(samples: &[f32]) -> Frame {
        let mut data = BytesMut::new();
        for s in samples {
            data.put_f32_le(*s);
        }
        Frame::audio(48_000, 1, "flt", samples.len(), data.freeze())
    }

    #[test]
    fn test_gain_scales_and_clamps() {
        let frame = apply_gain(float_frame(&[0.25, -0.5, 0.75]), 2.0);
        let samples: Vec<f32> = frame
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(samples, vec![0.5, -1.0, 1.0]);

        let untouched = float_frame(&[0.25]);
        assert_eq!(apply_gain(untouched.clone(), 1.0).data, untouched.data);
    }

    #[test]
    fn test_video_filter_gates_pre_roll_and_forwards_eof() {
        let h = Harness::new(MediaKind::Video);
        h.recording.store(false, Ordering::Release);
        let input = Arc::new(FrameQueue::new("screen", 8));
        h.selector.select(SourceKind::Screen, Arc::clone(&input));

        let stage = StageThread::new(
            "FilterStage[video]",
            VideoFilterWorker::new(
                Arc::clone(&h.selector),
                Box::new(PassthroughFilter::default()),
                Arc::clone(&h.output),
                Arc::clone(&h.recording),
                Arc::clone(&h.health),
            ),
            h.wakers(),
        );
        stage.start().unwrap();

        input.enqueue(Frame::video(64, 64, "yuv420p", Bytes::new()).with_pts(1, TimeBase::new(1, 30)));
        std::thread::sleep(Duration::from_millis(50));
        h.recording.store(true, Ordering::Release);
        input.enqueue(Frame::video(64, 64, "yuv420p", Bytes::new()).with_pts(2, TimeBase::new(1, 30)));
        input.enqueue_eof();

        let mut pts = Vec::new();
        while let Some(envelope) = h.output.dequeue_timeout(Duration::from_secs(2)) {
            match envelope.item {
                QueueItem::Item(frame) => pts.push(frame.pts.unwrap()),
                QueueItem::Eof => break,
                QueueItem::Flush => {}
            }
        }
        assert_eq!(pts, vec![2]);
        shutdown(&[&stage]).unwrap();
    }

    #[test]
    fn test_mix_generates_paced_silence_when_idle() {
        let h = Harness::new(MediaKind::Audio);
        let config = AudioConfig {
            source: None,
            ..AudioConfig::default()
        };
        let stage = StageThread::new(
            "MixStage[audio]",
            AudioMixWorker::new(
                &config,
                Arc::clone(&h.selector),
                Box::new(PassthroughFilter::default()),
                Arc::clone(&h.output),
                Arc::clone(&h.recording),
                Arc::clone(&h.health),
            ),
            h.wakers(),
        );
        stage.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        shutdown(&[&stage]).unwrap();

        // 200ms of 1024-sample frames at 48kHz is about 9.4 frames
        h.output.start();
        let mut frames = 0;
        while let Some(envelope) = h.output.try_dequeue() {
            let frame = envelope.into_item().unwrap();
            assert_eq!(frame.nb_samples, 1024);
            assert!(frame.data.iter().all(|b| *b == 0));
            frames += 1;
        }
        assert!((7..=12).contains(&frames), "got {frames} silence frames");
    }

    #[test]
    fn test_mix_applies_source_gain() {
        let h = Harness::new(MediaKind::Audio);
        let config = AudioConfig {
            microphone_gain: 0.5,
            silence_when_idle: false,
            ..AudioConfig::default()
        };
        let input = Arc::new(FrameQueue::new("mic", 8));
        h.selector.select(SourceKind::Microphone, Arc::clone(&input));
        let stage = StageThread::new(
            "MixStage[audio]",
            AudioMixWorker::new(
                &config,
                Arc::clone(&h.selector),
                Box::new(PassthroughFilter::default()),
                Arc::clone(&h.output),
                Arc::clone(&h.recording),
                Arc::clone(&h.health),
            ),
            h.wakers(),
        );
        stage.start().unwrap();
        input.enqueue(float_frame(&[0.5, 1.0]));
        input.enqueue_eof();

        let first = h.output.dequeue_timeout(Duration::from_secs(2)).unwrap();
        let frame = first.into_item().unwrap();
        assert_eq!(f32::from_le_bytes(<[u8; 4]>::try_from(&frame.data[0..4]).unwrap()), 0.25);
        assert!(h.output.dequeue_timeout(Duration::from_secs(2)).unwrap().is_eof());
        shutdown(&[&stage]).unwrap();
    }

    #[test]
    fn test_draining_without_source_emits_eof() {
        let h = Harness::new(MediaKind::Video);
        let stage = StageThread::new(
            "FilterStage[video]",
            VideoFilterWorker::new(
                Arc::clone(&h.selector),
                Box::new(PassthroughFilter::default()),
                Arc::clone(&h.output),
                Arc::clone(&h.recording),
                Arc::clone(&h.health),
            ),
            h.wakers(),
        );
        stage.start().unwrap();
        stage.drain().unwrap();
        let envelope = h.output.dequeue_timeout(Duration::from_secs(2)).unwrap();
        assert!(envelope.is_eof());
        shutdown(&[&stage]).unwrap();
    }
}
