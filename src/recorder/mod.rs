//! Composition root: owns the pipeline context and the event plumbing

mod chain;
mod context;

pub use chain::{SourceChain, SourceQueues};
pub use context::PipelineContext;

use crate::codec::CodecRuntime;
use crate::config::RecorderConfig;
use crate::error::EventError;
use crate::event::{
    ControlEventType, Event, EventFactoryManager, EventLoop, EventParams, EventQueue, WorkerPool,
};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{shutdown, PipelineStage};
use crate::pipeline::types::SourceKind;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Callbacks from the recorder to its host; all run on internal threads
pub trait RecorderObserver: Send + Sync {
    /// Formatted active capture time, `mm:ss.d`
    fn on_progress(&self, _elapsed: &str) {}

    fn on_output_path(&self, _path: &Path) {}

    /// Size of the video source just opened
    fn on_resolution(&self, _width: u32, _height: u32) {}

    fn on_capture_stopped(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl RecorderObserver for NoopObserver {}

pub struct Recorder {
    config: RecorderConfig,
    runtime: Arc<dyn CodecRuntime>,
    observer: Arc<dyn RecorderObserver>,
    factories: Arc<EventFactoryManager>,
    queue: Arc<EventQueue>,
    pool: Arc<WorkerPool>,
    event_loop: EventLoop,
    context: Mutex<Option<Arc<PipelineContext>>>,
    /// Serializes start/stop
    lifecycle: Mutex<()>,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        runtime: Arc<dyn CodecRuntime>,
        observer: Arc<dyn RecorderObserver>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let queue = Arc::new(EventQueue::new("events", config.events.queue_capacity));
        let pool = Arc::new(WorkerPool::new("event-pool"));
        let event_loop = EventLoop::for_queue(Arc::clone(&queue), Arc::clone(&pool));
        info!(
            "Recorder: {} runtime, output {}",
            runtime.name(),
            config.output.path.display()
        );
        Ok(Self {
            config,
            runtime,
            observer,
            factories: Arc::new(EventFactoryManager::with_defaults()),
            queue,
            pool,
            event_loop,
            context: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn factories(&self) -> &Arc<EventFactoryManager> {
        &self.factories
    }

    /// Current pipeline context, if initialized
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.context.lock().clone()
    }

    pub fn health(&self) -> Option<Arc<PipelineHealth>> {
        self.context().map(|context| Arc::clone(context.health()))
    }

    pub fn is_recording(&self) -> bool {
        self.context().is_some_and(|context| context.is_recording())
    }

    pub fn is_paused(&self) -> bool {
        self.context().is_some_and(|context| context.is_paused())
    }

    /// Build the pipeline and open the configured sources; no-op when done
    pub fn initialize(&self) -> anyhow::Result<Arc<PipelineContext>> {
        let mut slot = self.context.lock();
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }

        let factories = Arc::clone(&self.factories);
        let queue = Arc::downgrade(&self.queue);
        let context = PipelineContext::new(
            self.config.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.observer),
            move |context| {
                Arc::new(move |elapsed: Duration| {
                    let (Some(context), Some(queue)) = (context.upgrade(), queue.upgrade()) else {
                        return;
                    };
                    match factories.create(&context, EventParams::progress(elapsed)) {
                        Ok(event) => {
                            if queue.try_enqueue(event).is_err() {
                                debug!("Recorder: event queue full, progress dropped");
                            }
                        }
                        Err(e) => warn!("Recorder: {}", e),
                    }
                })
            },
        )?;

        if let Err(e) = context.initialize() {
            let _ = context.teardown();
            return Err(e);
        }
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Start recording into the configured output
    pub fn start(&self) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let context = self.initialize()?;
        if context.is_recording() {
            return Ok(());
        }

        self.queue.clear();
        self.queue.start();
        self.pool.start(self.config.events.pool_size)?;
        self.event_loop.start()?;

        if let Err(e) = context.begin_recording() {
            self.stop_event_loop();
            return Err(e);
        }
        Ok(())
    }

    /// Drain and finalize the recording, then release every source
    pub fn stop(&self) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let Some(context) = self.context.lock().take() else {
            return Ok(());
        };

        self.stop_event_loop();
        let finished = context.finish_recording(self.config.drain_timeout());
        let torn_down = context.teardown();
        finished.and(torn_down)
    }

    /// Queued events are dropped; events already on the pool finish first
    fn stop_event_loop(&self) {
        if let Err(e) = shutdown(&[&self.event_loop]) {
            warn!("Recorder: {}", e);
        }
        self.pool.shutdown();
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("Recorder: dropped {} pending events", dropped);
        }
    }

    /// Queue `event` while recording, run it inline otherwise
    pub fn post(&self, event: Box<dyn Event>) -> anyhow::Result<()> {
        if self.event_loop.state().is_active() {
            if !self.queue.enqueue(event) {
                return Err(EventError::QueueStopped.into());
            }
            return Ok(());
        }
        event.work()
    }

    /// Create an event for `params` and post it
    pub fn dispatch(&self, params: EventParams) -> anyhow::Result<()> {
        let context = self.initialize()?;
        let event = self.factories.create(&context, params)?;
        self.post(event)
    }

    pub fn pause(&self) -> anyhow::Result<()> {
        self.dispatch(EventParams::Control(ControlEventType::Pause))
    }

    pub fn resume(&self) -> anyhow::Result<()> {
        self.dispatch(EventParams::Control(ControlEventType::Ready))
    }

    /// Screen ↔ camera
    pub fn switch_video_source(&self) -> anyhow::Result<()> {
        self.dispatch(EventParams::Control(ControlEventType::SourceChange))
    }

    /// System audio ↔ microphone; refused while recording
    pub fn switch_audio_source(&self) -> anyhow::Result<()> {
        self.dispatch(EventParams::Control(ControlEventType::AudioSourceChange))
    }

    pub fn open_source(&self, source: SourceKind) -> anyhow::Result<()> {
        self.dispatch(EventParams::open_source(source))
    }

    pub fn close_source(&self, source: SourceKind) -> anyhow::Result<()> {
        self.dispatch(EventParams::close_source(source))
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Recorder: {:#}", e);
        }
    }
}
