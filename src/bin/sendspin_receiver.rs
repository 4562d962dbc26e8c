//! CLI entry point: loads config, initializes logging, and runs until
//! interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sendspin_client::audio::Frame;
use sendspin_client::config::{self, ReceiverConfig};
use sendspin_client::playback::{AudioSink, PlaybackError};
use sendspin_client::supervisor::ConnectionSupervisor;
use sendspin_client::time_filter::TimeFilter;

/// Counts frames and reports infinite headroom. A real build wires a
/// platform backend (e.g. a `cpal` output stream) here instead; `AudioSink`
/// stays a trait so this binary doesn't hardcode one.
struct SilentSink {
    sample_rate_hz: u32,
    frames_written: AtomicU64,
}

impl AudioSink for SilentSink {
    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    fn headroom_frames(&self) -> usize {
        960
    }

    fn write(&self, frames: &[Frame]) -> Result<usize, PlaybackError> {
        self.frames_written.fetch_add(frames.len() as u64, Ordering::Relaxed);
        Ok(frames.len())
    }
}

fn parse_args() -> Option<PathBuf> {
    std::env::args().nth(1).map(PathBuf::from)
}

fn init_logging(config: &ReceiverConfig) {
    let env = env_logger::Env::default().default_filter_or(config.log_level.clone());
    env_logger::Builder::from_env(env).format_timestamp_millis().init();
}

fn main() {
    let config = match parse_args() {
        Some(path) => config::load(&path),
        None => config::load_defaults(),
    };

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    log::info!(target: "sendspin::cli", "starting receiver with profile {}", config.profile);

    let filter = Arc::new(Mutex::new(TimeFilter::new()));
    let sink = Arc::new(SilentSink {
        sample_rate_hz: 48_000,
        frames_written: AtomicU64::new(0),
    });
    let supervisor = Arc::new(ConnectionSupervisor::new(config, filter, sink));

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            log::info!(target: "sendspin::cli", "received interrupt, shutting down");
            running.store(false, std::sync::atomic::Ordering::SeqCst);
        })
        .expect("failed to install signal handler");
    }

    log::info!(
        target: "sendspin::cli",
        "supervisor ready, phase={:?}",
        supervisor.snapshot().phase
    );

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    log::info!(target: "sendspin::cli", "stopped");
}
