//! Control events: pause, resume and source switches

use super::{ControlEventType, Event, EventCategory, EventFactory, EventParams};
use crate::error::EventError;
use crate::recorder::PipelineContext;
use log::info;
use std::sync::Arc;

/// Stop stamping frames; both clocks enter pause at the same instant
pub struct PauseEvent {
    context: Arc<PipelineContext>,
}

impl Event for PauseEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Control
    }

    fn name(&self) -> &'static str {
        "pause"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        self.context.set_paused(true);
        Ok(())
    }
}

/// Resume after [`PauseEvent`]
pub struct ReadyEvent {
    context: Arc<PipelineContext>,
}

impl Event for ReadyEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Control
    }

    fn name(&self) -> &'static str {
        "ready"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        self.context.set_paused(false);
        Ok(())
    }
}

/// Swap screen and camera, restarting the video encoder
pub struct SourceChangeEvent {
    context: Arc<PipelineContext>,
}

impl Event for SourceChangeEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Control
    }

    fn name(&self) -> &'static str {
        "source change"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        let now = self.context.swap_video_source()?;
        info!("SourceChangeEvent: video now from {}", now);
        Ok(())
    }
}

/// Swap system audio and microphone; only while not recording
pub struct AudioSourceChangeEvent {
    context: Arc<PipelineContext>,
}

impl Event for AudioSourceChangeEvent {
    fn category(&self) -> EventCategory {
        EventCategory::Control
    }

    fn name(&self) -> &'static str {
        "audio source change"
    }

    fn work(self: Box<Self>) -> anyhow::Result<()> {
        if self.context.is_recording() {
            return Err(EventError::Busy("audio source change").into());
        }
        let now = self.context.swap_audio_source()?;
        info!("AudioSourceChangeEvent: audio now from {}", now);
        Ok(())
    }
}

pub struct ControlEventFactory;

impl EventFactory for ControlEventFactory {
    fn category(&self) -> EventCategory {
        EventCategory::Control
    }

    fn create(
        &self,
        context: &Arc<PipelineContext>,
        params: EventParams,
    ) -> Result<Box<dyn Event>, EventError> {
        let EventParams::Control(sub_type) = params else {
            return Err(EventError::InvalidParams(EventCategory::Control));
        };
        let context = Arc::clone(context);
        match sub_type {
            ControlEventType::Pause => Ok(Box::new(PauseEvent { context })),
            ControlEventType::Ready => Ok(Box::new(ReadyEvent { context })),
            ControlEventType::SourceChange => Ok(Box::new(SourceChangeEvent { context })),
            ControlEventType::AudioSourceChange => {
                if context.is_recording() {
                    return Err(EventError::Busy("audio source change"));
                }
                Ok(Box::new(AudioSourceChangeEvent { context }))
            }
            other => Err(EventError::UnknownEventType {
                category: EventCategory::Control,
                sub_type: format!("{:?}", other),
            }),
        }
    }
}
