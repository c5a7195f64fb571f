//! Staged capture pipeline
//!
//! Every stage runs on its own OS thread and talks to its neighbours through
//! [`BoundedQueue`](crate::queue::BoundedQueue)s:
//!
//! ```text
//! demux → decode ─┐                      (one chain per live source)
//!                 ├→ filter/mix → encode ─┐
//! demux → decode ─┘                       ├→ mux → container
//!                    filter/mix → encode ─┘
//! ```
//!
//! - Control: [`state::StageControl`] state machine, [`stage::StageThread`] lifecycle
//! - Timing: [`clock::StreamClock`] maps wall time to stream timestamps
//! - Health: shared counters for drops, failures and muxed output

use std::time::Duration;

pub mod clock;
pub mod decode;
pub mod demux;
pub mod encode;
pub mod filter;
pub mod health;
pub mod mux;
pub mod selector;
pub mod stage;
pub mod state;
pub mod types;

pub use clock::{RecordingEpoch, StreamClock};
pub use health::{HealthSummary, PipelineHealth};
pub use mux::ProgressHook;
pub use selector::SourceSelector;
pub use stage::{shutdown, Flow, PipelineStage, StageThread, StageWorker};
pub use state::{StageControl, StageState};
pub use types::{Frame, MediaKind, Packet, SourceKind, TimeBase};

/// Longest a stage blocks on an input that is stopped or unselected
pub(crate) const INPUT_WAIT: Duration = Duration::from_millis(100);
