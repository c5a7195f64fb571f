//! Typed errors shared across the pipeline
//!
//! Application-level code (recorder lifecycle, event work, CLI) uses
//! `anyhow::Result`; the enums here are what callers need to match on.

use crate::pipeline::state::StageState;
use crate::pipeline::types::MediaKind;

/// Result of a codec/container call that did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// More input is required before output can be produced (EAGAIN).
    #[error("resource temporarily unavailable")]
    Again,
    /// The stream ended gracefully.
    #[error("end of stream")]
    Eof,
    /// Anything else: terminates the owning stage.
    #[error("{0}")]
    Fatal(String),
}

impl CodecError {
    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        CodecError::Fatal(msg.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Fatal(_))
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ac_ffmpeg::Error> for CodecError {
    fn from(err: ac_ffmpeg::Error) -> Self {
        CodecError::Fatal(err.to_string())
    }
}

/// Lifecycle violations on a stage thread.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage {stage}: cannot {action} while {state}")]
    InvalidTransition {
        stage: String,
        action: &'static str,
        state: StageState,
    },
    #[error("stage {0}: worker thread is still attached, call wait() first")]
    NotJoined(String),
    #[error("stage {0}: worker thread panicked")]
    Panicked(String),
    #[error("stage {0}: failed to spawn thread: {1}")]
    Spawn(String, std::io::Error),
}

/// Muxer failures.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("invalid time base {num}/{den} for {kind} stream")]
    InvalidTimeBase { kind: MediaKind, num: i32, den: i32 },
    #[error("no {0} stream registered")]
    UnknownStream(MediaKind),
    #[error("cannot add a new {0} stream after the header was written")]
    HeaderAlreadyWritten(MediaKind),
    #[error("packet submitted before the header was written")]
    HeaderNotWritten,
    #[error("no container sink opened")]
    NoSink,
    #[error("muxer stopped before both streams were registered")]
    Stopped,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Control-plane event construction and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("no factory registered for {0} events")]
    UnknownCategory(crate::event::EventCategory),
    #[error("Unknown {category} event type: {sub_type}")]
    UnknownEventType {
        category: crate::event::EventCategory,
        sub_type: String,
    },
    #[error("invalid parameters for {0} event")]
    InvalidParams(crate::event::EventCategory),
    #[error("{0} is not allowed while recording")]
    Busy(&'static str),
    #[error("event queue is stopped")]
    QueueStopped,
    #[error("worker pool is shut down")]
    PoolClosed,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} source is configured as {1}")]
    WrongMedia(&'static str, MediaKind),
    #[error("audio.source is unset and audio.silence_when_idle is off, the audio stream would never start")]
    NoAudioStream,
}
