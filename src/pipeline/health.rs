//! Health counters for a recording pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a pipeline
///
/// Shared by every stage of one recorder. All fields use atomic operations
/// for thread-safe access.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    /// Frames handed to an encoder
    pub frames_processed: AtomicU64,

    /// Frames dropped while paused, before recording, or on a full queue
    pub frame_drops: AtomicU64,

    /// Fatal codec or container errors (each one ends a stage)
    pub codec_failures: AtomicU64,

    /// Items discarded because their serial predates a reinitialization
    pub stale_discards: AtomicU64,

    /// Packets dropped for a missing or negative timestamp
    pub invalid_timestamps: AtomicU64,

    /// Packets written to the container
    pub packets_muxed: AtomicU64,

    /// Payload bytes written to the container
    pub bytes_muxed: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_codec_failure(&self) {
        self.codec_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_discard(&self) {
        self.stale_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_timestamp(&self) {
        self.invalid_timestamps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_muxed(&self, size: usize) {
        self.packets_muxed.fetch_add(1, Ordering::Relaxed);
        self.bytes_muxed.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Calculate the frame drop rate as a percentage
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops.load(Ordering::Relaxed);
        let processed = self.frames_processed.load(Ordering::Relaxed);
        if processed + drops == 0 {
            return 0.0;
        }
        (drops as f64 / (processed + drops) as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frame_drops: self.frame_drops.load(Ordering::Relaxed),
            codec_failures: self.codec_failures.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            invalid_timestamps: self.invalid_timestamps.load(Ordering::Relaxed),
            packets_muxed: self.packets_muxed.load(Ordering::Relaxed),
            bytes_muxed: self.bytes_muxed.load(Ordering::Relaxed),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }

    /// Zero every counter before a new recording
    pub fn reset(&self) {
        for counter in [
            &self.frames_processed,
            &self.frame_drops,
            &self.codec_failures,
            &self.stale_discards,
            &self.invalid_timestamps,
            &self.packets_muxed,
            &self.bytes_muxed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    pub frames_processed: u64,
    pub frame_drops: u64,
    pub codec_failures: u64,
    pub stale_discards: u64,
    pub invalid_timestamps: u64,
    pub packets_muxed: u64,
    pub bytes_muxed: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} drops, {:.2}%), {} codec failures, {} stale, {} bad timestamps, {} packets muxed ({} bytes)",
            self.frames_processed,
            self.frame_drops,
            self.frame_drop_rate,
            self.codec_failures,
            self.stale_discards,
            self.invalid_timestamps,
            self.packets_muxed,
            self.bytes_muxed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_frame();
        health.record_frame();
        health.record_frame();
        health.record_frame_drop();
        health.record_muxed(1000);
        health.record_muxed(500);

        let summary = health.summary();
        assert_eq!(summary.frames_processed, 3);
        assert_eq!(summary.frame_drops, 1);
        assert_eq!(summary.packets_muxed, 2);
        assert_eq!(summary.bytes_muxed, 1500);
        assert!((summary.frame_drop_rate - 25.0).abs() < f64::EPSILON);
        assert!(summary.to_string().starts_with("Health: 3 frames (1 drops"));

        health.reset();
        assert_eq!(health.summary().frames_processed, 0);
        assert_eq!(health.frame_drop_rate(), 0.0);
    }
}
