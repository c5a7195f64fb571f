//! Container muxer shared by both encoder stages
//!
//! Stream registration, header and trailer are write-once transitions guarded
//! by one `RwLock`; packet submission only takes the read side, so audio and
//! video can be submitted concurrently. The sink itself sits behind its own
//! mutex, always locked after the state lock.

mod interleave;

pub use interleave::{Interleaver, Pick, SyncPolicy};

use crate::codec::ContainerSink;
use crate::error::MuxError;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::types::{MediaKind, Packet, StreamParams, TimeBase};
use crate::queue::Wakeable;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const HEADER_POLL: Duration = Duration::from_millis(10);

/// One registered output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSlot {
    pub index: usize,
    /// Time base of packets coming from the encoder
    pub codec_time_base: TimeBase,
    /// Time base the container writes in
    pub stream_time_base: TimeBase,
}

#[derive(Debug, Default)]
struct MuxerState {
    audio: Option<StreamSlot>,
    video: Option<StreamSlot>,
    stream_count: usize,
    header_written: bool,
    trailer_written: bool,
}

impl MuxerState {
    fn slot(&self, kind: MediaKind) -> Option<StreamSlot> {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<StreamSlot> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn ready(&self) -> bool {
        self.stream_count == 2
    }
}

pub struct Muxer {
    state: RwLock<MuxerState>,
    sink: Mutex<Option<Box<dyn ContainerSink>>>,
    ready_lock: Mutex<()>,
    ready: Condvar,
    stopped: AtomicBool,
    health: Arc<PipelineHealth>,
}

impl Muxer {
    pub fn new(health: Arc<PipelineHealth>) -> Self {
        Self {
            state: RwLock::new(MuxerState::default()),
            sink: Mutex::new(None),
            ready_lock: Mutex::new(()),
            ready: Condvar::new(),
            stopped: AtomicBool::new(false),
            health,
        }
    }

    /// Install a fresh sink, finalizing and discarding any previous one
    pub fn open(&self, sink: Box<dyn ContainerSink>) {
        self.close();
        *self.sink.lock() = Some(sink);
        self.stopped.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Register the stream produced by one encoder.
    ///
    /// After the header is written a kind that is already registered is only
    /// rebound to the new codec time base (encoder restart); new kinds are
    /// rejected.
    pub fn add_stream(&self, params: &StreamParams) -> Result<usize, MuxError> {
        let tb = params.time_base;
        if !tb.is_valid() {
            return Err(MuxError::InvalidTimeBase {
                kind: params.kind,
                num: tb.num,
                den: tb.den,
            });
        }

        let mut state = self.state.write();
        if let Some(slot) = state.slot(params.kind) {
            if state.header_written {
                let rebound = StreamSlot {
                    codec_time_base: tb,
                    ..slot
                };
                *state.slot_mut(params.kind) = Some(rebound);
                info!("Muxer: rebound {} stream {} to {}", params.kind, slot.index, tb);
                return Ok(slot.index);
            }
        } else if state.header_written {
            return Err(MuxError::HeaderAlreadyWritten(params.kind));
        }

        let (index, stream_time_base) = {
            let mut sink = self.sink.lock();
            let sink = sink.as_mut().ok_or(MuxError::NoSink)?;
            sink.add_stream(params)?
        };
        let replaced = state
            .slot_mut(params.kind)
            .replace(StreamSlot {
                index,
                codec_time_base: tb,
                stream_time_base,
            })
            .is_some();
        if !replaced {
            state.stream_count += 1;
        }
        info!(
            "Muxer: added {} stream #{} ({}, codec tb {}, stream tb {})",
            params.kind, index, params.codec, tb, stream_time_base
        );
        let ready = state.ready();
        drop(state);
        if ready {
            let _guard = self.ready_lock.lock();
            self.ready.notify_all();
        }
        Ok(index)
    }

    pub fn stream(&self, kind: MediaKind) -> Option<StreamSlot> {
        self.state.read().slot(kind)
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().ready()
    }

    pub fn header_written(&self) -> bool {
        self.state.read().header_written
    }

    pub fn trailer_written(&self) -> bool {
        self.state.read().trailer_written
    }

    /// Block until both streams are registered, then write the header once.
    ///
    /// Returns [`MuxError::Stopped`] if [`wake`](Wakeable::wake) is called
    /// first.
    pub fn write_header(&self) -> Result<(), MuxError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(MuxError::Stopped);
            }
            if self.is_ready() {
                break;
            }
            let mut guard = self.ready_lock.lock();
            if !self.is_ready() && !self.stopped.load(Ordering::Acquire) {
                let _ = self.ready.wait_for(&mut guard, HEADER_POLL);
            }
        }

        let mut state = self.state.write();
        if state.header_written {
            return Ok(());
        }
        let mut sink = self.sink.lock();
        let sink = sink.as_mut().ok_or(MuxError::NoSink)?;
        sink.write_header()?;
        state.header_written = true;
        info!("Muxer: header written");
        Ok(())
    }

    /// Rescale `packet` into its stream time base and write it.
    ///
    /// Returns `Ok(false)` when the packet was dropped for a missing or
    /// negative timestamp.
    pub fn mux(&self, mut packet: Packet) -> Result<bool, MuxError> {
        let state = self.state.read();
        if !state.header_written {
            return Err(MuxError::HeaderNotWritten);
        }
        let slot = state.slot(packet.kind).ok_or(MuxError::UnknownStream(packet.kind))?;

        let from = if packet.time_base.is_valid() {
            packet.time_base
        } else {
            slot.codec_time_base
        };
        let to = slot.stream_time_base;

        let Some(pts) = packet.pts.map(|pts| from.rescale(pts, to)) else {
            self.health.record_invalid_timestamp();
            return Ok(false);
        };
        if pts < 0 {
            self.health.record_invalid_timestamp();
            debug!("Muxer: dropped {} packet with negative pts {}", packet.kind, pts);
            return Ok(false);
        }

        packet.pts = Some(pts);
        packet.dts = packet.dts.map(|dts| from.rescale(dts, to));
        packet.duration = from.rescale(packet.duration, to);
        packet.time_base = to;
        packet.stream_index = slot.index;

        let size = packet.size();
        let mut sink = self.sink.lock();
        let sink = sink.as_mut().ok_or(MuxError::NoSink)?;
        sink.write_packet(packet)?;
        self.health.record_muxed(size);
        Ok(true)
    }

    /// Write the trailer if a header was written and no trailer yet.
    ///
    /// Returns whether this call wrote it.
    pub fn write_trailer(&self) -> Result<bool, MuxError> {
        let mut state = self.state.write();
        if !state.header_written || state.trailer_written {
            return Ok(false);
        }
        // Set first: a failing trailer must not be retried on drop
        state.trailer_written = true;
        let mut sink = self.sink.lock();
        let sink = sink.as_mut().ok_or(MuxError::NoSink)?;
        sink.write_trailer().map_err(MuxError::from)?;
        info!("Muxer: trailer written");
        Ok(true)
    }

    /// Finalize and reset to the unopened state
    pub fn close(&self) {
        if let Err(e) = self.write_trailer() {
            warn!("Muxer: trailer failed on close: {}", e);
        }
        *self.state.write() = MuxerState::default();
        self.sink.lock().take();
    }
}

impl Wakeable for Muxer {
    fn wake(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.ready_lock.lock();
        self.ready.notify_all();
    }

    fn restart(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    fn label(&self) -> &str {
        "muxer"
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        if let Err(e) = self.write_trailer() {
            warn!("Muxer: trailer failed on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::synthetic::{MemorySink, SinkProbe};
    use bytes::Bytes;
    use std::thread;

    fn open_muxer() -> (Arc<Muxer>, SinkProbe, Arc<PipelineHealth>) {
        let health = Arc::new(PipelineHealth::new());
        let muxer = Arc::new(Muxer::new(Arc::clone(&health)));
        let probe = SinkProbe::default();
        muxer.open(Box::new(MemorySink::new(probe.clone())));
        (muxer, probe, health)
    }

    fn video_params() -> StreamParams {
        StreamParams::video("h264", 640, 360, TimeBase::new(1, 30))
    }

    fn audio_params() -> StreamParams {
        StreamParams::audio("aac", 48_000, 2, TimeBase::new(1, 48_000))
    }

    fn packet(kind: MediaKind, pts: Option<i64>, tb: TimeBase) -> Packet {
        Packet::new(kind, Bytes::from_static(b"payload"), pts, tb)
    }

    #[test]
    fn test_header_waits_for_both_streams() {
        let (muxer, probe, _) = open_muxer();
        muxer.add_stream(&video_params()).unwrap();

        let waiter = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.write_header())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!muxer.header_written());
        assert_eq!(probe.snapshot().headers_written, 0);

        muxer.add_stream(&audio_params()).unwrap();
        waiter.join().unwrap().unwrap();
        assert!(muxer.header_written());
        assert_eq!(probe.snapshot().headers_written, 1);
    }

    #[test]
    fn test_wake_releases_header_wait() {
        let (muxer, _, _) = open_muxer();
        let waiter = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.write_header())
        };
        thread::sleep(Duration::from_millis(20));
        muxer.wake();
        assert!(matches!(waiter.join().unwrap(), Err(MuxError::Stopped)));
    }

    #[test]
    fn test_packets_rescaled_into_stream_time_base() {
        let (muxer, probe, health) = open_muxer();
        muxer.add_stream(&video_params()).unwrap();
        muxer.add_stream(&audio_params()).unwrap();
        muxer.write_header().unwrap();

        let tb = TimeBase::new(1, 30);
        assert!(muxer.mux(packet(MediaKind::Video, Some(3), tb).with_duration(1)).unwrap());
        let report = probe.snapshot();
        let written = &report.packets[0];
        assert_eq!(written.pts, Some(9000));
        assert_eq!(written.stream_index, 0);
        assert_eq!(health.summary().packets_muxed, 1);
    }

    #[test]
    fn test_invalid_timestamps_dropped() {
        let (muxer, probe, health) = open_muxer();
        muxer.add_stream(&video_params()).unwrap();
        muxer.add_stream(&audio_params()).unwrap();
        assert!(matches!(
            muxer.mux(packet(MediaKind::Video, Some(0), TimeBase::new(1, 30))),
            Err(MuxError::HeaderNotWritten)
        ));
        muxer.write_header().unwrap();

        let tb = TimeBase::new(1, 48_000);
        assert!(!muxer.mux(packet(MediaKind::Audio, None, tb)).unwrap());
        assert!(!muxer.mux(packet(MediaKind::Audio, Some(-1024), tb)).unwrap());
        assert!(muxer.mux(packet(MediaKind::Audio, Some(1024), tb)).unwrap());
        assert_eq!(probe.snapshot().packets.len(), 1);
        assert_eq!(health.summary().invalid_timestamps, 2);
    }

    #[test]
    fn test_trailer_written_once() {
        let (muxer, probe, _) = open_muxer();
        // No header yet: nothing to finalize
        assert!(!muxer.write_trailer().unwrap());

        muxer.add_stream(&video_params()).unwrap();
        muxer.add_stream(&audio_params()).unwrap();
        muxer.write_header().unwrap();
        assert!(muxer.write_trailer().unwrap());
        assert!(!muxer.write_trailer().unwrap());
        muxer.close();
        assert_eq!(probe.snapshot().trailers_written, 1);
        assert!(!muxer.is_open());
    }

    #[test]
    fn test_drop_writes_pending_trailer() {
        let (muxer, probe, _) = open_muxer();
        muxer.add_stream(&video_params()).unwrap();
        muxer.add_stream(&audio_params()).unwrap();
        muxer.write_header().unwrap();
        drop(muxer);
        assert_eq!(probe.snapshot().trailers_written, 1);
    }

    #[test]
    fn test_stream_registration_rules() {
        let (muxer, probe, _) = open_muxer();
        let bad = StreamParams::video("h264", 640, 360, TimeBase::new(0, 30));
        assert!(matches!(
            muxer.add_stream(&bad),
            Err(MuxError::InvalidTimeBase { num: 0, den: 30, .. })
        ));

        muxer.add_stream(&video_params()).unwrap();
        muxer.add_stream(&audio_params()).unwrap();
        muxer.write_header().unwrap();

        // Encoder restart: same kind rebinds without a new container stream
        let restarted = StreamParams::video("h264", 640, 360, TimeBase::new(1, 60));
        assert_eq!(muxer.add_stream(&restarted).unwrap(), 0);
        assert_eq!(
            muxer.stream(MediaKind::Video).unwrap().codec_time_base,
            TimeBase::new(1, 60)
        );
        assert_eq!(probe.snapshot().streams.len(), 2);
    }
}
