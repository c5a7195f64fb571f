//! Audio/video write-order policy

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How much earlier than video an audio packet may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Constant bias subtracted from the audio timestamp
    Fixed { threshold_ms: u32 },
    /// Running average of recent |audio - video| deltas, clamped to `max_ms`
    Adaptive { max_ms: u32, window: usize },
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Fixed { threshold_ms: 0 }
    }
}

/// Which pending packet to write next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    Audio,
    Video,
}

/// Decides the write order of two time-ordered packet streams
#[derive(Debug)]
pub struct Interleaver {
    policy: SyncPolicy,
    deltas: VecDeque<i64>,
    delta_sum: i64,
}

impl Interleaver {
    pub fn new(policy: SyncPolicy) -> Self {
        Self {
            policy,
            deltas: VecDeque::new(),
            delta_sum: 0,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Current bias in microseconds, after feeding the pair `(audio, video)`
    fn bias(&mut self, audio_us: i64, video_us: i64) -> i64 {
        match self.policy {
            SyncPolicy::Fixed { threshold_ms } => threshold_ms as i64 * 1000,
            SyncPolicy::Adaptive { max_ms, window } => {
                let delta = (audio_us - video_us).abs();
                self.deltas.push_back(delta);
                self.delta_sum += delta;
                while self.deltas.len() > window.max(1) {
                    if let Some(old) = self.deltas.pop_front() {
                        self.delta_sum -= old;
                    }
                }
                let average = self.delta_sum / self.deltas.len() as i64;
                average.min(max_ms as i64 * 1000)
            }
        }
    }

    /// Audio goes first when `audio - bias <= video`
    pub fn pick(&mut self, audio_us: i64, video_us: i64) -> Pick {
        let bias = self.bias(audio_us, video_us);
        if audio_us - bias <= video_us {
            Pick::Audio
        } else {
            Pick::Video
        }
    }

    pub fn reset(&mut self) {
        self.deltas.clear();
        self.delta_sum = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Merge two timestamp lists (ms) the way the mux thread does
    fn merge(policy: SyncPolicy, audio: &[i64], video: &[i64]) -> Vec<String> {
        let mut interleaver = Interleaver::new(policy);
        let (mut a, mut v) = (audio.iter().peekable(), video.iter().peekable());
        let mut out = Vec::new();
        loop {
            match (a.peek(), v.peek()) {
                (Some(&&at), Some(&&vt)) => match interleaver.pick(at * 1000, vt * 1000) {
                    Pick::Audio => out.push(format!("A{}", a.next().unwrap())),
                    Pick::Video => out.push(format!("V{}", v.next().unwrap())),
                },
                (Some(_), None) => out.push(format!("A{}", a.next().unwrap())),
                (None, Some(_)) => out.push(format!("V{}", v.next().unwrap())),
                (None, None) => break,
            }
        }
        out
    }

    const AUDIO: [i64; 4] = [0, 10, 20, 30];
    const VIDEO: [i64; 4] = [0, 16, 33, 50];

    #[test]
    fn test_fixed_reference_order() {
        let order = merge(SyncPolicy::default(), &AUDIO, &VIDEO);
        assert_eq!(order, ["A0", "V0", "A10", "V16", "A20", "A30", "V33", "V50"]);
    }

    #[test]
    fn test_adaptive_order_with_33ms_clamp() {
        let order = merge(SyncPolicy::Adaptive { max_ms: 33, window: 16 }, &AUDIO, &VIDEO);
        assert_eq!(order, ["A0", "V0", "A10", "A20", "V16", "A30", "V33", "V50"]);
    }

    #[test]
    fn test_merge_is_reproducible() {
        let policy = SyncPolicy::Adaptive { max_ms: 33, window: 16 };
        assert_eq!(merge(policy, &AUDIO, &VIDEO), merge(policy, &AUDIO, &VIDEO));
    }

    #[test]
    fn test_adaptive_bias_is_clamped() {
        let mut interleaver = Interleaver::new(SyncPolicy::Adaptive { max_ms: 33, window: 4 });
        // Huge skew: bias stays at 33ms so video still wins
        for _ in 0..4 {
            assert_eq!(interleaver.pick(1_000_000, 0), Pick::Video);
        }
        // Audio within the clamp goes first
        assert_eq!(interleaver.pick(30_000, 0), Pick::Audio);
    }

    #[test]
    fn test_fixed_threshold_favours_audio() {
        let mut interleaver = Interleaver::new(SyncPolicy::Fixed { threshold_ms: 20 });
        assert_eq!(interleaver.pick(20_000, 0), Pick::Audio);
        assert_eq!(interleaver.pick(20_001, 0), Pick::Video);
    }
}
