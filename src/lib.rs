//! Concurrent capture-pipeline recorder
//!
//! Capture sources feed `demux → decode → filter/mix → encode → mux` stage
//! threads joined by bounded queues. A [`Recorder`](recorder::Recorder) owns
//! the pipeline and applies control events (pause, resume, source switches)
//! while a recording is running.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod muxer;
pub mod pipeline;
pub mod queue;
pub mod recorder;
pub mod utils;

pub use config::RecorderConfig;
pub use error::{CodecError, EventError, MuxError, StageError};
pub use recorder::{NoopObserver, Recorder, RecorderObserver};
