//! Control-plane events
//!
//! User actions (pause, resume, source switches) and pipeline notifications
//! (capture progress) are turned into [`Event`] objects by an
//! [`EventFactoryManager`], queued on the [`EventQueue`] and executed on the
//! [`WorkerPool`] by the [`EventLoop`] thread.

mod control;
mod event_loop;
mod factory;
mod pool;
mod process;
mod source;

pub use control::{
    AudioSourceChangeEvent, ControlEventFactory, PauseEvent, ReadyEvent, SourceChangeEvent,
};
pub use event_loop::{EventLoop, EventLoopWorker};
pub use factory::{EventFactory, EventFactoryManager};
pub use pool::WorkerPool;
pub use process::{format_elapsed, CaptureProcessEvent, ProcessEventFactory, ProgressGate};
pub use source::{CloseSourceEvent, OpenSourceEvent, SourceEventFactory};

use crate::pipeline::types::SourceKind;
use crate::queue::BoundedQueue;
use std::time::Duration;

/// Event family; one factory per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Control,
    Source,
    Process,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Control => write!(f, "control"),
            EventCategory::Source => write!(f, "source"),
            EventCategory::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEventType {
    Start,
    Stop,
    Pause,
    /// Resume after a pause
    Ready,
    End,
    /// Screen ↔ camera
    SourceChange,
    /// System audio ↔ microphone
    AudioSourceChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEventType {
    OpenSource,
    CloseSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventType {
    CaptureProcess,
}

/// Category-specific construction parameters
#[derive(Debug, Clone, PartialEq)]
pub enum EventParams {
    Control(ControlEventType),
    Source {
        sub_type: SourceEventType,
        source: SourceKind,
        /// Also restart the encoder fed by this source
        restart_encoder: bool,
    },
    Process {
        sub_type: ProcessEventType,
        elapsed: Duration,
    },
}

impl EventParams {
    pub fn category(&self) -> EventCategory {
        match self {
            EventParams::Control(_) => EventCategory::Control,
            EventParams::Source { .. } => EventCategory::Source,
            EventParams::Process { .. } => EventCategory::Process,
        }
    }

    pub fn open_source(source: SourceKind) -> Self {
        EventParams::Source {
            sub_type: SourceEventType::OpenSource,
            source,
            restart_encoder: false,
        }
    }

    pub fn close_source(source: SourceKind) -> Self {
        EventParams::Source {
            sub_type: SourceEventType::CloseSource,
            source,
            restart_encoder: false,
        }
    }

    pub fn progress(elapsed: Duration) -> Self {
        EventParams::Process {
            sub_type: ProcessEventType::CaptureProcess,
            elapsed,
        }
    }
}

/// A command executed exactly once, on a pool thread
pub trait Event: Send {
    fn category(&self) -> EventCategory;

    fn name(&self) -> &'static str;

    fn work(self: Box<Self>) -> anyhow::Result<()>;
}

impl std::fmt::Debug for dyn Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event({}/{})", self.category(), self.name())
    }
}

/// Queue between the API surface and the event loop
pub type EventQueue = BoundedQueue<Box<dyn Event>>;
