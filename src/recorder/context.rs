//! Shared state of one recorder session
//!
//! Owns every stage thread and queue of the pipeline. Source chains are opened
//! and closed under the `chains` lock, which also serializes source events.

use super::chain::{SourceChain, SourceQueues};
use super::RecorderObserver;
use crate::codec::CodecRuntime;
use crate::config::RecorderConfig;
use crate::event::ProgressGate;
use crate::muxer::Muxer;
use crate::pipeline::clock::{RecordingEpoch, StreamClock};
use crate::pipeline::encode::EncodeWorker;
use crate::pipeline::filter::{AudioMixWorker, VideoFilterWorker};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::mux::{MuxWorker, ProgressHook};
use crate::pipeline::selector::SourceSelector;
use crate::pipeline::stage::{shutdown, PipelineStage, StageThread};
use crate::pipeline::types::{MediaKind, SourceKind, TimeBase};
use crate::queue::{FrameQueue, PacketQueue, Wakeable};
use anyhow::Context;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const DRAIN_POLL: Duration = Duration::from_millis(10);

pub struct PipelineContext {
    config: RecorderConfig,
    runtime: Arc<dyn CodecRuntime>,
    observer: Arc<dyn RecorderObserver>,
    health: Arc<PipelineHealth>,
    epoch: RecordingEpoch,
    video_clock: Arc<StreamClock>,
    audio_clock: Arc<StreamClock>,
    recording: Arc<AtomicBool>,
    paused: AtomicBool,
    progress_gate: ProgressGate,
    muxer: Arc<Muxer>,

    video_selector: Arc<SourceSelector>,
    audio_selector: Arc<SourceSelector>,
    source_queues: HashMap<SourceKind, SourceQueues>,
    /// Live chains; at most one per media kind
    chains: Mutex<HashMap<SourceKind, SourceChain>>,

    /// filter/mix → encode
    video_frames: Arc<FrameQueue>,
    audio_frames: Arc<FrameQueue>,
    /// encode → mux
    video_packets: Arc<PacketQueue>,
    audio_packets: Arc<PacketQueue>,

    video_filter: StageThread<VideoFilterWorker>,
    audio_mix: StageThread<AudioMixWorker>,
    video_encoder: StageThread<EncodeWorker>,
    audio_encoder: StageThread<EncodeWorker>,
    mux: StageThread<MuxWorker>,
}

impl PipelineContext {
    /// Build every stage without starting any thread.
    ///
    /// `progress` receives a weak handle on the context being built and
    /// returns the hook the mux thread reports capture progress through.
    pub fn new(
        config: RecorderConfig,
        runtime: Arc<dyn CodecRuntime>,
        observer: Arc<dyn RecorderObserver>,
        progress: impl FnOnce(Weak<PipelineContext>) -> ProgressHook,
    ) -> anyhow::Result<Arc<Self>> {
        let video_filter = runtime
            .open_video_filter(&config.video)
            .context("opening video filter")?;
        let audio_filter = runtime
            .open_audio_filter(&config.audio)
            .context("opening audio filter")?;

        Ok(Arc::new_cyclic(|weak| {
            let health = Arc::new(PipelineHealth::new());
            let epoch = RecordingEpoch::new();
            let recording = Arc::new(AtomicBool::new(false));
            let video_clock = Arc::new(StreamClock::new(
                MediaKind::Video,
                TimeBase::new(1, config.video.fps as i32),
                epoch.clone(),
            ));
            let audio_clock = Arc::new(StreamClock::new(
                MediaKind::Audio,
                TimeBase::new(1, config.audio.sample_rate as i32),
                epoch.clone(),
            ));
            let muxer = Arc::new(Muxer::new(Arc::clone(&health)));

            let video_selector = Arc::new(SourceSelector::new(MediaKind::Video));
            let audio_selector = Arc::new(SourceSelector::new(MediaKind::Audio));
            let source_queues = SourceKind::ALL
                .into_iter()
                .map(|kind| (kind, SourceQueues::new(kind, &config.queues)))
                .collect();

            let queues = &config.queues;
            let video_frames = Arc::new(FrameQueue::new("video-filtered", queues.video_frames));
            let audio_frames = Arc::new(FrameQueue::new("audio-mixed", queues.audio_frames));
            let video_packets = Arc::new(PacketQueue::new("video-encoded", queues.encoded));
            let audio_packets = Arc::new(PacketQueue::new("audio-encoded", queues.encoded));

            let video_filter = StageThread::new(
                "FilterStage[video]",
                VideoFilterWorker::new(
                    Arc::clone(&video_selector),
                    video_filter,
                    Arc::clone(&video_frames),
                    Arc::clone(&recording),
                    Arc::clone(&health),
                ),
                vec![
                    Arc::clone(&video_selector) as Arc<dyn Wakeable>,
                    Arc::clone(&video_frames) as Arc<dyn Wakeable>,
                ],
            );
            let audio_mix = StageThread::new(
                "MixStage[audio]",
                AudioMixWorker::new(
                    &config.audio,
                    Arc::clone(&audio_selector),
                    audio_filter,
                    Arc::clone(&audio_frames),
                    Arc::clone(&recording),
                    Arc::clone(&health),
                ),
                vec![
                    Arc::clone(&audio_selector) as Arc<dyn Wakeable>,
                    Arc::clone(&audio_frames) as Arc<dyn Wakeable>,
                ],
            );

            let encoder = |kind: MediaKind,
                           input: &Arc<FrameQueue>,
                           output: &Arc<PacketQueue>,
                           clock: &Arc<StreamClock>| {
                StageThread::new(
                    format!("EncodeStage[{}]", kind),
                    EncodeWorker::new(
                        kind,
                        Arc::clone(input),
                        Arc::clone(output),
                        Arc::clone(&runtime),
                        config.video.clone(),
                        config.audio.clone(),
                        Arc::clone(clock),
                        Arc::clone(&muxer),
                        Arc::clone(&health),
                    ),
                    vec![
                        Arc::clone(input) as Arc<dyn Wakeable>,
                        Arc::clone(output) as Arc<dyn Wakeable>,
                    ],
                )
            };
            let video_encoder = encoder(MediaKind::Video, &video_frames, &video_packets, &video_clock);
            let audio_encoder = encoder(MediaKind::Audio, &audio_frames, &audio_packets, &audio_clock);

            let mux = StageThread::new(
                "MuxStage",
                MuxWorker::new(
                    Arc::clone(&muxer),
                    Arc::clone(&audio_packets),
                    Arc::clone(&video_packets),
                    config.sync,
                    Arc::clone(&health),
                )
                .with_progress(
                    progress(weak.clone()),
                    Duration::from_millis(config.events.progress_interval_ms),
                ),
                vec![
                    Arc::clone(&muxer) as Arc<dyn Wakeable>,
                    Arc::clone(&audio_packets) as Arc<dyn Wakeable>,
                    Arc::clone(&video_packets) as Arc<dyn Wakeable>,
                ],
            );

            Self {
                config,
                runtime,
                observer,
                health,
                epoch,
                video_clock,
                audio_clock,
                recording,
                paused: AtomicBool::new(false),
                progress_gate: ProgressGate::default(),
                muxer,
                video_selector,
                audio_selector,
                source_queues,
                chains: Mutex::new(HashMap::new()),
                video_frames,
                audio_frames,
                video_packets,
                audio_packets,
                video_filter,
                audio_mix,
                video_encoder,
                audio_encoder,
                mux,
            }
        }))
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<dyn RecorderObserver> {
        &self.observer
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn progress_gate(&self) -> &ProgressGate {
        &self.progress_gate
    }

    pub fn muxer(&self) -> &Arc<Muxer> {
        &self.muxer
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Recorded time so far, pauses excluded
    pub fn active_time(&self) -> Duration {
        self.video_clock.active_time(Instant::now())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn video_source(&self) -> Option<SourceKind> {
        self.video_selector.selected()
    }

    pub fn audio_source(&self) -> Option<SourceKind> {
        self.audio_selector.selected()
    }

    pub fn live_sources(&self) -> Vec<SourceKind> {
        let chains = self.chains.lock();
        SourceKind::ALL
            .into_iter()
            .filter(|kind| chains.contains_key(kind))
            .collect()
    }

    fn selector(&self, media: MediaKind) -> &Arc<SourceSelector> {
        match media {
            MediaKind::Video => &self.video_selector,
            MediaKind::Audio => &self.audio_selector,
        }
    }

    fn encoder(&self, media: MediaKind) -> &StageThread<EncodeWorker> {
        match media {
            MediaKind::Video => &self.video_encoder,
            MediaKind::Audio => &self.audio_encoder,
        }
    }

    /// Start the filter stages and open the configured sources
    pub fn initialize(&self) -> anyhow::Result<()> {
        self.video_filter.start()?;
        self.audio_mix.start()?;

        let mut chains = self.chains.lock();
        self.open_locked(&mut chains, self.config.video.source, false)?;
        if let Some(audio) = self.config.audio.source {
            self.open_locked(&mut chains, audio, false)?;
        }
        Ok(())
    }

    /// (Re)open `kind`, closing whichever source of the same media is live
    pub fn open_source(&self, kind: SourceKind, restart_encoder: bool) -> anyhow::Result<()> {
        let mut chains = self.chains.lock();
        self.open_locked(&mut chains, kind, restart_encoder)
    }

    pub fn close_source(&self, kind: SourceKind) -> anyhow::Result<()> {
        let mut chains = self.chains.lock();
        self.close_locked(&mut chains, kind)?;
        Ok(())
    }

    /// Screen ↔ camera; returns the source now selected
    pub fn swap_video_source(&self) -> anyhow::Result<SourceKind> {
        let mut chains = self.chains.lock();
        let target = self
            .video_selector
            .selected()
            .unwrap_or(self.config.video.source)
            .counterpart();
        self.open_locked(&mut chains, target, self.is_recording())?;
        Ok(target)
    }

    /// System audio ↔ microphone; returns the source now selected
    pub fn swap_audio_source(&self) -> anyhow::Result<SourceKind> {
        let mut chains = self.chains.lock();
        let target = self
            .audio_selector
            .selected()
            .map(|kind| kind.counterpart())
            .unwrap_or(SourceKind::SystemAudio);
        self.open_locked(&mut chains, target, false)?;
        Ok(target)
    }

    fn close_locked(
        &self,
        chains: &mut HashMap<SourceKind, SourceChain>,
        kind: SourceKind,
    ) -> anyhow::Result<bool> {
        let Some(chain) = chains.remove(&kind) else {
            debug!("PipelineContext: {} is not open", kind);
            return Ok(false);
        };
        self.selector(kind.media()).deselect(kind);
        chain
            .shutdown()
            .with_context(|| format!("closing {} source", kind))?;
        info!("PipelineContext: closed {}", kind);
        Ok(true)
    }

    fn open_locked(
        &self,
        chains: &mut HashMap<SourceKind, SourceChain>,
        kind: SourceKind,
        restart_encoder: bool,
    ) -> anyhow::Result<()> {
        self.close_locked(chains, kind)?;
        self.close_locked(chains, kind.counterpart())?;

        if restart_encoder && self.is_recording() {
            self.restart_encoder(kind.media())?;
        }

        let Some(queues) = self.source_queues.get(&kind) else {
            anyhow::bail!("no queues for {}", kind);
        };
        let chain = SourceChain::open(
            kind,
            self.config.sources.get(kind),
            &*self.runtime,
            queues,
            &self.health,
        )?;
        chain.start()?;

        if kind.media() == MediaKind::Video {
            let params = chain.params();
            self.observer.on_resolution(params.width, params.height);
        }
        self.selector(kind.media())
            .select(kind, Arc::clone(chain.frames()));
        info!("PipelineContext: opened {}", kind);
        chains.insert(kind, chain);
        Ok(())
    }

    /// Replace the encoder of `media`; the muxer keeps its stream
    fn restart_encoder(&self, media: MediaKind) -> anyhow::Result<()> {
        let encoder = self.encoder(media);
        shutdown(&[encoder]).with_context(|| format!("stopping {} encoder", media))?;
        encoder.start()?;
        debug!("PipelineContext: {} encoder restarted", media);
        Ok(())
    }

    /// Freeze or resume both stream clocks at the same instant
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) == paused {
            return;
        }
        let now = Instant::now();
        self.video_clock.set_paused(paused, now);
        self.audio_clock.set_paused(paused, now);
        info!(
            "PipelineContext: {} at {:.1}s",
            if paused { "paused" } else { "resumed" },
            self.epoch.elapsed().as_secs_f64()
        );
    }

    /// Open the output, reset clocks and counters, run encoders and mux
    pub fn begin_recording(&self) -> anyhow::Result<()> {
        if self.is_recording() {
            return Ok(());
        }
        let sink = self
            .runtime
            .open_sink(&self.config.output)
            .with_context(|| format!("opening output {}", self.config.output.path.display()))?;
        self.muxer.open(sink);

        for queue in [&self.video_frames, &self.audio_frames] {
            queue.clear();
        }
        for queue in [&self.video_packets, &self.audio_packets] {
            queue.clear();
        }
        self.health.reset();
        self.progress_gate.reset();
        self.video_clock.reset();
        self.audio_clock.reset();
        self.paused.store(false, Ordering::Release);
        self.epoch.set(Instant::now());
        self.recording.store(true, Ordering::Release);

        let started = self
            .video_encoder
            .start()
            .and_then(|_| self.audio_encoder.start())
            .and_then(|_| self.mux.start());
        if let Err(e) = started {
            error!("PipelineContext: failed to start recording: {}", e);
            self.recording.store(false, Ordering::Release);
            let _ = shutdown(&[&self.mux, &self.video_encoder, &self.audio_encoder]);
            self.muxer.close();
            return Err(e.into());
        }
        self.observer.on_output_path(&self.config.output.path);
        info!("PipelineContext: recording to {}", self.config.output.path.display());
        Ok(())
    }

    /// Drain every live stage into the container and finalize it.
    ///
    /// Waits at most `timeout` for the mux thread before forcing teardown.
    pub fn finish_recording(&self, timeout: Duration) -> anyhow::Result<()> {
        if !self.is_recording() {
            return Ok(());
        }

        for chain in self.chains.lock().values() {
            if let Err(e) = chain.drain() {
                warn!("PipelineContext: {}", e);
            }
        }
        for stage in [&self.video_filter as &dyn PipelineStage, &self.audio_mix] {
            if let Err(e) = stage.drain() {
                warn!("PipelineContext: {}", e);
            }
        }

        let deadline = Instant::now() + timeout;
        while !self.mux.is_finished() && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL);
        }
        if !self.mux.is_finished() {
            warn!("PipelineContext: drain timed out after {:?}, forcing teardown", timeout);
        }

        let result = shutdown(&[&self.mux, &self.video_encoder, &self.audio_encoder]);
        self.muxer.close();
        self.recording.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.epoch.clear();

        info!("PipelineContext: {}", self.health.summary());
        self.observer.on_capture_stopped();
        result.context("stopping encoders")
    }

    /// Stop every remaining thread and close every source
    pub fn teardown(&self) -> anyhow::Result<()> {
        let mut first_err = shutdown(&[
            &self.mux,
            &self.video_encoder,
            &self.audio_encoder,
            &self.video_filter,
            &self.audio_mix,
        ])
        .err()
        .map(anyhow::Error::from);

        let mut chains = self.chains.lock();
        for (kind, chain) in chains.drain() {
            self.selector(kind.media()).deselect(kind);
            if let Err(e) = chain.shutdown() {
                warn!("PipelineContext: closing {}: {}", kind, e);
                first_err.get_or_insert(e.into());
            }
        }
        drop(chains);

        self.muxer.close();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
