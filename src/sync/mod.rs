//! Drives the time-sync round-trip cadence (burst then steady) and feeds
//! accepted measurements to [`TimeFilter`](crate::time_filter::TimeFilter) in
//! `client_us` order. The burst/steady cadence itself has no direct analogue
//! elsewhere in this codebase, but the task-spawn/cancellation-token
//! structure driving it is grounded on the same `tokio::select!`-driven
//! background-task pattern `bass-webrtc`'s connection supervisors use.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::time_filter::TimeFilter;

/// The controller's correction math never fails — out-of-range measurements
/// are dropped, not propagated as errors. `NotRunning` exists only to catch
/// the one misuse case: stopping a driver that was never started.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync controller is not running")]
    NotRunning,
}

const BURST_ROUND_TRIPS: usize = 10;
const BURST_SPACING: Duration = Duration::from_millis(50);
const STEADY_SPACING: Duration = Duration::from_millis(250);
const STALE_RTT_US: i64 = 15_000_000;

const STATE_IDLE: u32 = 0;
const STATE_BURSTING: u32 = 1;
const STATE_STEADY: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Bursting,
    Steady,
}

impl From<u32> for SyncState {
    fn from(v: u32) -> Self {
        match v {
            STATE_BURSTING => SyncState::Bursting,
            STATE_STEADY => SyncState::Steady,
            _ => SyncState::Idle,
        }
    }
}

/// A single round-trip's result, handed to `on_server_time`.
#[derive(Debug, Clone, Copy)]
pub struct TimeMeasurement {
    pub client_transmitted_us: i64,
    pub server_received_us: i64,
    pub server_transmitted_us: i64,
    pub client_received_us: i64,
}

impl TimeMeasurement {
    pub fn rtt_us(&self) -> i64 {
        self.client_received_us - self.client_transmitted_us
    }

    /// Midpoint offset estimate: server clock minus client clock, correcting
    /// for the round trip by assuming symmetric network delay.
    pub fn offset_us(&self) -> f64 {
        let server_mid =
            (self.server_received_us as f64 + self.server_transmitted_us as f64) / 2.0;
        let client_mid =
            (self.client_transmitted_us as f64 + self.client_received_us as f64) / 2.0;
        server_mid - client_mid
    }

    pub fn max_error_us(&self) -> f64 {
        (self.rtt_us() as f64 / 2.0).max(0.0)
    }
}

/// Trait object invoked by the driver loop to actually send a time-sync
/// request; kept generic over the transport so `SyncController` has no
/// direct dependency on `StreamTransport`.
pub type SendTimesyncFn = Arc<dyn Fn() + Send + Sync>;

pub struct SyncController {
    filter: Arc<Mutex<TimeFilter>>,
    state: Arc<AtomicU32>,
    burst_in_progress: Arc<AtomicBool>,
    burst_buffer: Arc<Mutex<Vec<TimeMeasurement>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    stop_signal: Arc<Notify>,
}

impl SyncController {
    pub fn new(filter: Arc<Mutex<TimeFilter>>) -> Self {
        SyncController {
            filter,
            state: Arc::new(AtomicU32::new(STATE_IDLE)),
            burst_in_progress: Arc::new(AtomicBool::new(false)),
            burst_buffer: Arc::new(Mutex::new(Vec::with_capacity(BURST_ROUND_TRIPS))),
            driver: Mutex::new(None),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn is_burst_in_progress(&self) -> bool {
        self.burst_in_progress.load(Ordering::SeqCst)
    }

    /// Launches the burst-then-steady driver. Safe to call again after
    /// `stop()` — `stop()` is required to have cleared `burst_in_progress`
    /// before returning.
    pub fn start(&self, send_timesync_fn: SendTimesyncFn) {
        self.burst_in_progress.store(true, Ordering::SeqCst);
        self.state.store(STATE_BURSTING, Ordering::SeqCst);
        self.burst_buffer.lock().clear();

        let state = self.state.clone();
        let burst_in_progress = self.burst_in_progress.clone();
        let burst_buffer = self.burst_buffer.clone();
        let filter = self.filter.clone();
        let stop_signal = self.stop_signal.clone();

        let handle = tokio::spawn(async move {
            for _ in 0..BURST_ROUND_TRIPS {
                tokio::select! {
                    _ = tokio::time::sleep(BURST_SPACING) => { send_timesync_fn(); }
                    _ = stop_signal.notified() => { return; }
                }
            }
            burst_in_progress.store(false, Ordering::SeqCst);
            let buffered: Vec<_> = burst_buffer.lock().drain(..).collect();
            for measurement in buffered {
                if measurement.rtt_us() < STALE_RTT_US {
                    feed_filter(&filter, &measurement);
                }
            }
            state.store(STATE_STEADY, Ordering::SeqCst);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STEADY_SPACING) => { send_timesync_fn(); }
                    _ = stop_signal.notified() => { return; }
                }
            }
        });

        *self.driver.lock() = Some(handle);
    }

    /// Cancels the driver and clears `burst_in_progress` unconditionally so
    /// a following `start()` behaves correctly even if called mid-burst.
    /// Returns `NotRunning` if no driver was started, since stopping a
    /// driver that never existed is always a caller bug, not a race.
    pub fn stop(&self) -> Result<(), SyncError> {
        self.stop_signal.notify_waiters();
        let handle = self.driver.lock().take();
        self.burst_in_progress.store(false, Ordering::SeqCst);
        self.state.store(STATE_IDLE, Ordering::SeqCst);
        match handle {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(SyncError::NotRunning),
        }
    }

    /// Routes a completed round-trip. During a burst, measurements are
    /// buffered and released to the filter in order once the burst ends (the
    /// driver task spawned by `start()` does this automatically); outside a
    /// burst, stale (`rtt >= 15s`) measurements are dropped.
    pub fn on_server_time(&self, measurement: TimeMeasurement) {
        if self.burst_in_progress.load(Ordering::SeqCst) {
            self.burst_buffer.lock().push(measurement);
            return;
        }
        if measurement.rtt_us() >= STALE_RTT_US {
            return;
        }
        self.feed(&measurement);
    }

    /// Decodes a raw time-sync response frame, stamps the
    /// local receive time, and routes it through `on_server_time`. Malformed
    /// frames are dropped and logged.
    pub fn on_server_time_frame(&self, bytes: &[u8], client_received_us: i64) {
        match crate::wire::decode_timesync_response(bytes) {
            Some((client_transmitted_us, server_received_us, server_transmitted_us)) => {
                self.on_server_time(TimeMeasurement {
                    client_transmitted_us,
                    server_received_us,
                    server_transmitted_us,
                    client_received_us,
                });
            }
            None => log::warn!(target: "sendspin::sync", "dropping malformed time-sync response frame"),
        }
    }

    /// Drains and feeds any buffered burst measurements. The driver task
    /// calls this itself when a burst completes; exposed for callers driving
    /// `on_server_time` without going through `start()`.
    pub fn flush_burst(&self) {
        let buffered: Vec<_> = self.burst_buffer.lock().drain(..).collect();
        for measurement in buffered {
            if measurement.rtt_us() < STALE_RTT_US {
                feed_filter(&self.filter, &measurement);
            }
        }
    }

    fn feed(&self, measurement: &TimeMeasurement) {
        feed_filter(&self.filter, measurement);
    }
}

fn feed_filter(filter: &Mutex<TimeFilter>, measurement: &TimeMeasurement) {
    let mut filter = filter.lock();
    filter.add_measurement(
        measurement.offset_us(),
        measurement.max_error_us(),
        measurement.client_transmitted_us,
        measurement.rtt_us(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(client_tx: i64, rtt: i64, offset: i64) -> TimeMeasurement {
        TimeMeasurement {
            client_transmitted_us: client_tx,
            server_received_us: client_tx + rtt / 2 + offset,
            server_transmitted_us: client_tx + rtt / 2 + offset,
            client_received_us: client_tx + rtt,
        }
    }

    #[test]
    fn server_time_frame_decodes_and_feeds_the_filter() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter.clone());
        let mut frame = vec![crate::wire::TIMESYNC_RESPONSE_TAG];
        frame.extend_from_slice(&0u64.to_le_bytes());
        frame.extend_from_slice(&10_000u64.to_le_bytes());
        frame.extend_from_slice(&10_000u64.to_le_bytes());
        controller.on_server_time_frame(&frame, 20_000);
        assert_eq!(filter.lock().state().measurement_count, 1);
    }

    #[test]
    fn malformed_server_time_frame_is_dropped_not_panicked() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter.clone());
        controller.on_server_time_frame(&[0u8; 3], 1_000);
        assert_eq!(filter.lock().state().measurement_count, 0);
    }

    #[test]
    fn stale_measurements_outside_a_burst_are_dropped() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter.clone());
        controller.on_server_time(measurement(0, 20_000_000, 10_000));
        assert_eq!(filter.lock().state().measurement_count, 0);
    }

    #[test]
    fn fresh_measurement_outside_a_burst_reaches_the_filter() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter.clone());
        controller.on_server_time(measurement(0, 20_000, 10_000));
        assert_eq!(filter.lock().state().measurement_count, 1);
    }

    #[test]
    fn measurements_during_a_burst_are_buffered_not_fed_immediately() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter.clone());
        controller.burst_in_progress.store(true, Ordering::SeqCst);
        controller.on_server_time(measurement(0, 20_000, 10_000));
        assert_eq!(filter.lock().state().measurement_count, 0);
        controller.flush_burst();
        assert_eq!(filter.lock().state().measurement_count, 1);
    }

    #[tokio::test]
    async fn stop_clears_burst_in_progress_so_restart_works() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter);
        controller.start(Arc::new(|| {}));
        assert!(controller.is_burst_in_progress());
        assert!(controller.stop().is_ok());
        assert!(!controller.is_burst_in_progress());
        controller.start(Arc::new(|| {}));
        assert!(controller.is_burst_in_progress());
        assert!(controller.stop().is_ok());
    }

    #[test]
    fn stopping_a_driver_that_was_never_started_reports_not_running() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let controller = SyncController::new(filter);
        assert!(matches!(controller.stop(), Err(SyncError::NotRunning)));
    }
}
