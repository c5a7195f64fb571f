//! Wall-clock timestamp model with pause/resume accounting

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::{MediaKind, TimeBase};

/// Recording start instant shared by every encoder stage
///
/// Cloning shares the same instant.
#[derive(Clone, Default)]
pub struct RecordingEpoch {
    start: Arc<RwLock<Option<Instant>>>,
}

impl RecordingEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, start: Instant) {
        *self.start.write() = Some(start);
    }

    pub fn clear(&self) {
        *self.start.write() = None;
    }

    pub fn get(&self) -> Option<Instant> {
        *self.start.read()
    }

    /// Time since the epoch, zero when unset
    pub fn elapsed(&self) -> Duration {
        self.get().map(|s| s.elapsed()).unwrap_or_default()
    }
}

impl std::fmt::Debug for RecordingEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEpoch")
            .field("elapsed", &self.elapsed())
            .field("set", &self.get().is_some())
            .finish()
    }
}

/// Timestamp assigned to one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Presentation timestamp in the clock's time base
    pub pts: i64,
    /// First frame after a resume: the encoder must emit an intra frame
    pub force_keyframe: bool,
}

#[derive(Debug, Default)]
struct PauseState {
    paused: bool,
    pause_start: Option<Instant>,
    pause_accum: Duration,
    next_pts: i64,
    force_keyframe: bool,
}

/// Per-stream wall-clock to timestamp mapping
///
/// Each encoder stage owns one. The pts of a frame is the wall time elapsed
/// since the shared [`RecordingEpoch`], minus the time spent paused, rescaled
/// into the stream time base and floored against the previous pts plus the
/// previous frame length, so the output never regresses.
///
/// # Thread Safety
///
/// Pause state lives behind its own mutex, never held together with a queue
/// lock.
pub struct StreamClock {
    kind: MediaKind,
    time_base: TimeBase,
    epoch: RecordingEpoch,
    state: Mutex<PauseState>,
}

impl StreamClock {
    pub fn new(kind: MediaKind, time_base: TimeBase, epoch: RecordingEpoch) -> Self {
        Self {
            kind,
            time_base,
            epoch,
            state: Mutex::new(PauseState::default()),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn epoch(&self) -> &RecordingEpoch {
        &self.epoch
    }

    /// Enter or leave pause at instant `at`. Repeated calls with the same
    /// value are ignored.
    pub fn set_paused(&self, paused: bool, at: Instant) {
        let mut state = self.state.lock();
        if state.paused == paused {
            return;
        }
        state.paused = paused;
        if paused {
            state.pause_start = Some(at);
        } else if let Some(start) = state.pause_start.take() {
            state.pause_accum += at.saturating_duration_since(start);
            if self.kind == MediaKind::Video {
                state.force_keyframe = true;
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn pause_accum(&self) -> Duration {
        self.state.lock().pause_accum
    }

    /// Stamp a frame observed at `now` covering `advance` ticks.
    ///
    /// `None` while paused or before the recording epoch is set; the caller
    /// drops the frame.
    pub fn stamp(&self, now: Instant, advance: i64) -> Option<Stamp> {
        let start = self.epoch.get()?;
        let mut state = self.state.lock();
        if state.paused {
            return None;
        }
        let active = now
            .saturating_duration_since(start)
            .saturating_sub(state.pause_accum);
        let wall_pts = self.time_base.from_duration(active);
        let pts = wall_pts.max(state.next_pts);
        state.next_pts = pts + advance.max(0);
        let force_keyframe = std::mem::take(&mut state.force_keyframe);
        Some(Stamp { pts, force_keyframe })
    }

    /// Clear per-recording state before a new recording starts
    pub fn reset(&self) {
        *self.state.lock() = PauseState::default();
    }

    /// Active (non-paused) time recorded so far
    pub fn active_time(&self, now: Instant) -> Duration {
        let Some(start) = self.epoch.get() else {
            return Duration::ZERO;
        };
        let state = self.state.lock();
        let until = match (state.paused, state.pause_start) {
            (true, Some(pause_start)) => pause_start,
            _ => now,
        };
        until
            .saturating_duration_since(start)
            .saturating_sub(state.pause_accum)
    }
}

impl std::fmt::Debug for StreamClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamClock")
            .field("kind", &self.kind)
            .field("time_base", &self.time_base)
            .field("paused", &state.paused)
            .field("pause_accum", &state.pause_accum)
            .field("next_pts", &state.next_pts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_clock(start: Instant) -> StreamClock {
        let epoch = RecordingEpoch::new();
        epoch.set(start);
        StreamClock::new(MediaKind::Video, TimeBase::new(1, 30), epoch)
    }

    #[test]
    fn test_no_stamp_before_epoch() {
        let clock = StreamClock::new(MediaKind::Audio, TimeBase::new(1, 48_000), RecordingEpoch::new());
        assert!(clock.stamp(Instant::now(), 1024).is_none());
    }

    #[test]
    fn test_wall_clock_pts() {
        let t0 = Instant::now();
        let clock = video_clock(t0);
        assert_eq!(clock.stamp(t0, 1).unwrap().pts, 0);
        assert_eq!(clock.stamp(t0 + Duration::from_millis(100), 1).unwrap().pts, 3);
        assert_eq!(clock.stamp(t0 + Duration::from_secs(1), 1).unwrap().pts, 30);
    }

    #[test]
    fn test_floor_prevents_regression() {
        let t0 = Instant::now();
        let clock = video_clock(t0);
        // Three frames arriving in a burst at the same instant
        let pts: Vec<i64> = (0..3)
            .map(|_| clock.stamp(t0 + Duration::from_millis(10), 1).unwrap().pts)
            .collect();
        assert_eq!(pts, vec![0, 1, 2]);
        // Jitter backwards in wall time still yields a larger pts
        assert_eq!(clock.stamp(t0, 1).unwrap().pts, 3);
    }

    #[test]
    fn test_pause_resume_monotonic() {
        let t0 = Instant::now();
        let clock = video_clock(t0);
        let mut last = -1;
        let mut forced = 0;

        for ms in (0..3000).step_by(33) {
            let now = t0 + Duration::from_millis(ms);
            if ms == 990 {
                clock.set_paused(true, now);
            }
            if ms == 1980 {
                clock.set_paused(false, now);
            }
            if let Some(stamp) = clock.stamp(now, 1) {
                assert!(stamp.pts > last, "pts regressed: {} after {}", stamp.pts, last);
                last = stamp.pts;
                if stamp.force_keyframe {
                    forced += 1;
                }
            }
        }

        assert_eq!(forced, 1);
        assert_eq!(clock.pause_accum(), Duration::from_millis(990));
        // Three seconds of wall time minus one paused second
        assert!((58..=61).contains(&last), "last pts {}", last);
    }

    #[test]
    fn test_frames_dropped_while_paused() {
        let t0 = Instant::now();
        let clock = video_clock(t0);
        clock.set_paused(true, t0);
        assert!(clock.is_paused());
        assert!(clock.stamp(t0 + Duration::from_millis(50), 1).is_none());
        clock.set_paused(true, t0 + Duration::from_millis(60));
        clock.set_paused(false, t0 + Duration::from_millis(100));
        assert_eq!(clock.pause_accum(), Duration::from_millis(100));
        let stamp = clock.stamp(t0 + Duration::from_millis(100), 1).unwrap();
        assert_eq!(stamp.pts, 0);
        assert!(stamp.force_keyframe);
    }

    #[test]
    fn test_audio_advance_by_samples() {
        let t0 = Instant::now();
        let epoch = RecordingEpoch::new();
        epoch.set(t0);
        let clock = StreamClock::new(MediaKind::Audio, TimeBase::new(1, 48_000), epoch);
        let a = clock.stamp(t0, 1024).unwrap();
        let b = clock.stamp(t0 + Duration::from_millis(1), 1024).unwrap();
        assert_eq!(a.pts, 0);
        assert_eq!(b.pts, 1024);
        assert!(!b.force_keyframe);

        clock.set_paused(true, t0);
        clock.set_paused(false, t0 + Duration::from_millis(5));
        assert!(!clock.stamp(t0 + Duration::from_secs(1), 1024).unwrap().force_keyframe);
    }

    #[test]
    fn test_active_time_excludes_pause() {
        let t0 = Instant::now();
        let clock = video_clock(t0);
        clock.set_paused(true, t0 + Duration::from_millis(500));
        assert_eq!(clock.active_time(t0 + Duration::from_secs(2)), Duration::from_millis(500));
        clock.set_paused(false, t0 + Duration::from_millis(1500));
        assert_eq!(clock.active_time(t0 + Duration::from_secs(2)), Duration::from_secs(1));
        clock.reset();
        assert!(!clock.is_paused());
        assert_eq!(clock.pause_accum(), Duration::ZERO);
    }
}
