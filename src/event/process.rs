//! Process events: capture progress notifications

use super::{Event, EventCategory, EventFactory, EventParams, ProcessEventType};
use crate::error::EventError;
use crate::recorder::PipelineContext;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// `mm:ss.d`; minutes keep counting past an hour
pub fn format_elapsed(elapsed: Duration) -> String {
    let tenths = elapsed.as_millis() / 100;
    let minutes = tenths / 600;
    let seconds = (tenths / 10) % 60;
    format!("{:02}:{:02}.{}", minutes, seconds, tenths % 10)
}

/// Keeps progress notifications in recorded-time order.
///
/// Process events run on the worker pool, so two of them can finish in either
/// order; a value not newer than the last one delivered is dropped.
#[derive(Debug, Default)]
pub struct ProgressGate {
    last: Mutex<Option<Duration>>,
}

impl ProgressGate {
    /// Run `notify` if `elapsed` is newer than every value passed so far
    pub fn pass(&self, elapsed: Duration, notify: impl FnOnce()) -> bool {
        let mut last = self.last.lock();
        if last.is_some_and(|last| last >= elapsed) {
            return false;
        }
        *last = Some(elapsed);
        notify();
        true
    }

    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

pub struct CaptureProcessEvent {
    context: Arc<PipelineContext>,
    elapsed: Duration,
}

impl Event for CaptureProcessEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Process
    }

    fn name(&self) -> &'static str {
        "capture process"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        let observer = self.context.observer();
        let delivered = self.context.progress_gate().pass(self.elapsed, || {
            observer.on_progress(&format_elapsed(self.elapsed));
        });
        if !delivered {
            debug!("CaptureProcessEvent: stale progress {:?} dropped", self.elapsed);
        }
        Ok(())
    }
}

pub struct ProcessEventFactory;

impl EventFactory for ProcessEventFactory {
    fn category(&self) -> EventCategory {
        EventCategory::Process
    }

    fn create(
        &self,
        context: &Arc<PipelineContext>,
        params: EventParams,
    ) -> Result<Box<dyn Event>, EventError> {
        match params {
            EventParams::Process {
                sub_type: ProcessEventType::CaptureProcess,
                elapsed,
            } => Ok(Box::new(CaptureProcessEvent {
                context: Arc::clone(context),
                elapsed,
            })),
            _ => Err(EventError::InvalidParams(EventCategory::Process)),
        }
    }
}
