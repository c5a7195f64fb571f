//! Bounded inter-stage queues
//!
//! Every edge of the pipeline graph, and the control-plane event queue, is a
//! [`BoundedQueue`]. Items carry the serial they were queued under so that a
//! consumer can tell a stale item from a current one after a reinitialization.

mod bounded;

pub use bounded::{BoundedQueue, Envelope, QueueItem};

use crate::pipeline::types::{Frame, Packet};

/// Something a blocked stage thread can be released from
pub trait Wakeable: Send + Sync {
    /// Release every thread blocked on this object
    fn wake(&self);

    /// Undo [`wake`](Self::wake) so blocking operations work again
    fn restart(&self);

    fn label(&self) -> &str;
}

/// Compressed packets between demux → decode and encode → mux
pub type PacketQueue = BoundedQueue<Packet>;

/// Decoded frames between decode → filter and filter → encode
pub type FrameQueue = BoundedQueue<Frame>;
