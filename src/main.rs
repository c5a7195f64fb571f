use anyhow::Context;
use castrec::codec::CodecRuntime;
use castrec::codec::synthetic::{SyntheticOptions, SyntheticRuntime};
use castrec::config::{app_name, version};
use castrec::utils::SignalOfStop;
use castrec::{Recorder, RecorderConfig, RecorderObserver};
use clap::{Arg, ArgAction, Command};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

struct LogObserver;

impl RecorderObserver for LogObserver {
    fn on_progress(&self, elapsed: &str) {
        info!("recording {}", elapsed);
    }

    fn on_output_path(&self, path: &Path) {
        info!("writing {}", path.display());
    }

    fn on_resolution(&self, width: u32, height: u32) {
        info!("video source {}x{}", width, height);
    }

    fn on_capture_stopped(&self) {
        info!("capture stopped");
    }
}

fn command() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file.")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Output file or stream URL, overrides the configuration.")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for Ctrl-C.")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Video frame rate.")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("synthetic")
                .long("synthetic")
                .help("Record generated test streams and write a JSON report.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dump-config")
                .long("dump-config")
                .help("Print the effective configuration and exit.")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(feature = "ffmpeg")]
fn runtime(config: &RecorderConfig, synthetic: bool) -> anyhow::Result<Arc<dyn CodecRuntime>> {
    if synthetic {
        return Ok(synthetic_runtime(config));
    }
    Ok(Arc::new(castrec::codec::ffmpeg::FfmpegRuntime::new()))
}

#[cfg(not(feature = "ffmpeg"))]
fn runtime(config: &RecorderConfig, synthetic: bool) -> anyhow::Result<Arc<dyn CodecRuntime>> {
    if !synthetic {
        info!("built without the ffmpeg feature, recording synthetic streams");
    }
    Ok(synthetic_runtime(config))
}

fn synthetic_runtime(config: &RecorderConfig) -> Arc<dyn CodecRuntime> {
    let mut options = SyntheticOptions::from_config(config);
    options.write_report = true;
    Arc::new(SyntheticRuntime::new(options))
}

fn run() -> anyhow::Result<()> {
    let matches = command().get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    if let Some(output) = matches.get_one::<PathBuf>("output") {
        config.output.path = output.clone();
    }
    if let Some(fps) = matches.get_one::<u32>("fps") {
        config.video.fps = *fps;
    }
    if matches.get_flag("dump-config") {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let runtime = runtime(&config, matches.get_flag("synthetic"))?;
    let recorder = Recorder::new(config, runtime, Arc::new(LogObserver))?;

    let sos = SignalOfStop::new();
    {
        let sos = sos.clone();
        ctrlc::set_handler(move || sos.cancel()).context("setting Ctrl-C handler")?;
    }

    recorder.start()?;
    match matches.get_one::<u64>("duration") {
        Some(seconds) => {
            sos.wait_timeout(Duration::from_secs(*seconds));
        }
        None => sos.wait_cancellation(),
    }
    recorder.stop()
}

fn main() {
    tracing_subscriber::fmt::init();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    if let Err(e) = run() {
        error!("{:#}", e);
        process::exit(1);
    }
}
