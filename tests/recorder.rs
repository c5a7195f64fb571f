use castrec::codec::CodecRuntime;
use castrec::codec::synthetic::{SinkReport, SyntheticOptions, SyntheticRuntime};
use castrec::pipeline::{MediaKind, SourceKind};
use castrec::{NoopObserver, Recorder, RecorderConfig, RecorderObserver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

fn config() -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.video.fps = 30;
    config.video.width = 64;
    config.video.height = 36;
    config.audio.frame_samples = 480;
    config.events.progress_interval_ms = 100;
    config
}

fn recorder_with(
    config: RecorderConfig,
    options: SyntheticOptions,
    observer: Arc<dyn RecorderObserver>,
) -> (Recorder, Arc<SyntheticRuntime>) {
    let runtime = Arc::new(SyntheticRuntime::new(options));
    let recorder = Recorder::new(config, Arc::clone(&runtime) as Arc<dyn CodecRuntime>, observer).unwrap();
    (recorder, runtime)
}

fn video_pts(report: &SinkReport) -> Vec<i64> {
    report
        .packets_of(MediaKind::Video)
        .map(|p| p.pts.unwrap())
        .collect()
}

fn assert_increasing(pts: &[i64]) {
    for pair in pts.windows(2) {
        assert!(pair[0] < pair[1], "pts went from {} to {}", pair[0], pair[1]);
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_record_with_pause() {
    let config = config();
    let options = SyntheticOptions::from_config(&config);
    let (recorder, runtime) = recorder_with(config, options, Arc::new(NoopObserver));

    recorder.start().unwrap();
    assert!(recorder.is_recording());
    let context = recorder.context().unwrap();
    sleep(Duration::from_millis(500));
    recorder.pause().unwrap();
    assert!(wait_until(Duration::from_secs(1), || recorder.is_paused()));
    sleep(Duration::from_millis(500));
    recorder.resume().unwrap();
    assert!(wait_until(Duration::from_secs(1), || !recorder.is_paused()));
    sleep(Duration::from_millis(1000));
    let active = context.active_time();
    recorder.stop().unwrap();
    assert!(!recorder.is_recording());

    let report = runtime.probe().snapshot();
    assert_eq!(report.headers_written, 1);
    assert_eq!(report.trailers_written, 1);
    assert_eq!(report.streams.len(), 2);

    // one frame per 1/30 s of active time; the 2 frame slack covers frames in
    // flight when pause and stop land
    let pts = video_pts(&report);
    let expected = active.as_secs_f64() * 30.0;
    assert!(
        (pts.len() as f64 - expected).abs() <= 2.0,
        "{} video packets for {:?} of active time",
        pts.len(),
        active
    );
    assert_increasing(&pts);
    // the paused half second leaves no gap in the timeline
    let last_ms = pts.last().unwrap() / 90;
    assert!(last_ms < 1_800, "last video pts at {}ms", last_ms);
    let span_frames = *pts.last().unwrap() as f64 / 3_000.0 + 1.0;
    assert!((pts.len() as f64 - span_frames).abs() <= 2.0);

    // keyframe on the first frame and after the resume
    let keyframes = report
        .packets_of(MediaKind::Video)
        .filter(|p| p.keyframe)
        .count();
    assert!(keyframes >= 2);

    let audio = report.packets_of(MediaKind::Audio).count();
    assert!(audio > 0);
}

#[test]
fn test_hot_swap_video_source() {
    let config = config();
    let options = SyntheticOptions::from_config(&config);
    let (recorder, runtime) = recorder_with(config, options, Arc::new(NoopObserver));

    recorder.start().unwrap();
    let context = recorder.context().unwrap();
    sleep(Duration::from_millis(400));

    recorder.switch_video_source().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        context.video_source() == Some(SourceKind::Camera)
    }));
    sleep(Duration::from_millis(400));
    recorder.stop().unwrap();

    assert!(!context.live_sources().contains(&SourceKind::Screen));
    let report = runtime.probe().snapshot();
    assert_eq!(report.trailers_written, 1);
    // the restarted encoder keeps writing into the same stream
    assert_eq!(report.streams.len(), 2);
    let pts = video_pts(&report);
    assert!(pts.len() > 12, "{} video packets", pts.len());
    assert_increasing(&pts);
}

#[test]
fn test_report_written_with_trailer() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.output.path = dir.path().join("capture.json");
    let mut options = SyntheticOptions::from_config(&config);
    options.write_report = true;
    let (recorder, _runtime) = recorder_with(config.clone(), options, Arc::new(NoopObserver));

    recorder.start().unwrap();
    sleep(Duration::from_millis(300));
    recorder.stop().unwrap();

    let text = std::fs::read_to_string(&config.output.path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["headers_written"], 1);
    assert_eq!(json["trailers_written"], 1);
    assert!(!json["packets"].as_array().unwrap().is_empty());
}

#[derive(Default)]
struct Collecting {
    progress: Mutex<Vec<String>>,
    resolutions: Mutex<Vec<(u32, u32)>>,
    stopped: Mutex<u32>,
}

impl RecorderObserver for Collecting {
    fn on_progress(&self, elapsed: &str) {
        self.progress.lock().push(elapsed.to_string());
    }

    fn on_resolution(&self, width: u32, height: u32) {
        self.resolutions.lock().push((width, height));
    }

    fn on_capture_stopped(&self) {
        *self.stopped.lock() += 1;
    }
}

#[test]
fn test_observer_notifications() {
    let config = config();
    let options = SyntheticOptions::from_config(&config);
    let observer = Arc::new(Collecting::default());
    let (recorder, _runtime) = recorder_with(config, options, Arc::clone(&observer) as Arc<dyn RecorderObserver>);

    recorder.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || observer.progress.lock().len() >= 3));
    recorder.stop().unwrap();

    let progress = observer.progress.lock().clone();
    assert!(progress[0].starts_with("00:00."));
    assert!(progress.iter().all(|p| p.len() == 7 && p.starts_with("00:")));
    assert_eq!(observer.resolutions.lock().first(), Some(&(64, 36)));
    assert_eq!(*observer.stopped.lock(), 1);
}

#[test]
fn test_restart_after_stop() {
    let config = config();
    let options = SyntheticOptions::from_config(&config);
    let (recorder, runtime) = recorder_with(config, options, Arc::new(NoopObserver));

    for _ in 0..2 {
        recorder.start().unwrap();
        sleep(Duration::from_millis(200));
        recorder.stop().unwrap();

        let report = runtime.probe().snapshot();
        assert_eq!(report.headers_written, 1);
        assert_eq!(report.trailers_written, 1);
        // recording starts from zero again
        assert!(video_pts(&report)[0] < 9_000);
    }
}
