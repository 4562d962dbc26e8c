//! Two-state Kalman filter tracking the offset and drift between the
//! server's clock and the local client clock.
//!
//! Grounded on the windowed-regression drift estimator in
//! `bass-ptp/src/servo.rs` (ring buffer of samples, low-pass-filtered rate,
//! lock/unlock hysteresis) but reworked as an explicit 2-state Kalman filter
//! per the offset/drift state vector this receiver needs, with an adaptive
//! process-noise term and a median/IQR outlier gate in front of the update
//! step.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock microseconds since the Unix epoch, the unit every
/// `client_*_us`/`server_*_us` field in this crate is expressed in.
pub fn now_client_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

const RECENT_OFFSETS_CAPACITY: usize = 10;
const INNOVATION_WINDOW_CAPACITY: usize = 20;
const OUTLIER_FORCE_ACCEPT_STREAK: u32 = 3;
const DRIFT_CLAMP: f64 = 5.0e-4;
const ADAPTIVE_FORGETTING_FACTOR: f64 = 1.002;
const Q_BASE_US2_PER_S: f64 = 100.0;
const Q_RATIO_MIN: f64 = 0.5;
const Q_RATIO_MAX: f64 = 5.0;
const WARMUP_MEASUREMENT_FLOOR: u64 = 20;
const WARMUP_STDDEV_CEILING_US: f64 = 15_000.0;
const WARMUP_MEASUREMENT_CAP: u64 = 100;
const CONVERGED_MIN_MEASUREMENTS: u64 = 5;
const CONVERGED_STDDEV_CEILING_US: f64 = 10_000.0;
const STALE_RTT_CEILING_US: i64 = 15_000_000;

/// Result of feeding a single round-trip measurement into the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementOutcome {
    Accepted,
    Rejected,
}

/// A 2x2 symmetric covariance matrix, stored densely since the state is tiny.
#[derive(Debug, Clone, Copy)]
struct Covariance {
    p00: f64,
    p01: f64,
    p11: f64,
}

impl Covariance {
    fn infinite() -> Self {
        Covariance {
            p00: f64::INFINITY,
            p01: 0.0,
            p11: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct FilterSnapshot {
    offset_us: f64,
    drift: f64,
    p: Covariance,
    measurement_count: u64,
    baseline_client_us: i64,
    last_update_us: i64,
    static_delay_us: f64,
    adaptive_q: f64,
    warmup_complete: bool,
}

/// Observable view of the filter's current belief, used by the facade and
/// by `SyncStats`.
#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    pub offset_us: f64,
    pub drift_ppm: f64,
    pub offset_stddev_us: f64,
    pub measurement_count: u64,
    pub is_ready: bool,
    pub is_converged: bool,
}

pub struct TimeFilter {
    offset_us: f64,
    drift: f64,
    p: Covariance,
    measurement_count: u64,
    baseline_client_us: i64,
    last_update_us: i64,
    static_delay_us: f64,
    recent_offsets: VecDeque<f64>,
    innovation_window: VecDeque<f64>,
    adaptive_q: f64,
    warmup_complete: bool,
    consecutive_rejections: u32,
    frozen: Option<FilterSnapshot>,
}

impl Default for TimeFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeFilter {
    pub fn new() -> Self {
        let mut filter = TimeFilter {
            offset_us: 0.0,
            drift: 0.0,
            p: Covariance::infinite(),
            measurement_count: 0,
            baseline_client_us: 0,
            last_update_us: 0,
            static_delay_us: 0.0,
            recent_offsets: VecDeque::with_capacity(RECENT_OFFSETS_CAPACITY),
            innovation_window: VecDeque::with_capacity(INNOVATION_WINDOW_CAPACITY),
            adaptive_q: Q_BASE_US2_PER_S,
            warmup_complete: false,
            consecutive_rejections: 0,
            frozen: None,
        };
        filter.reset();
        filter
    }

    /// Discards all learned state. `static_delay_us` is also cleared.
    pub fn reset(&mut self) {
        self.offset_us = 0.0;
        self.drift = 0.0;
        self.p = Covariance::infinite();
        self.measurement_count = 0;
        self.baseline_client_us = 0;
        self.last_update_us = 0;
        self.static_delay_us = 0.0;
        self.recent_offsets.clear();
        self.innovation_window.clear();
        self.adaptive_q = Q_BASE_US2_PER_S;
        self.warmup_complete = false;
        self.consecutive_rejections = 0;
        self.frozen = None;
    }

    pub fn set_static_delay_us(&mut self, delay_us: f64) {
        self.static_delay_us = delay_us;
    }

    pub fn static_delay_us(&self) -> f64 {
        self.static_delay_us
    }

    /// Feeds one round-trip measurement into the filter.
    ///
    /// `offset_us` is the estimated `server_time - client_time` for this
    /// sample, `max_error_us` is the caller's error-bound estimate
    /// (`rtt_us / 2`), `client_us` is the local clock reading the
    /// measurement is anchored to, and `rtt_us` is the round trip time of
    /// the exchange that produced it — measurements with an implausible
    /// RTT are discarded as stale before anything else runs.
    pub fn add_measurement(
        &mut self,
        offset_us: f64,
        max_error_us: f64,
        client_us: i64,
        rtt_us: i64,
    ) -> MeasurementOutcome {
        if !offset_us.is_finite() || !max_error_us.is_finite() {
            return MeasurementOutcome::Rejected;
        }
        if rtt_us > STALE_RTT_CEILING_US {
            return MeasurementOutcome::Rejected;
        }
        let measurement_variance_us2 = max_error_us * max_error_us;

        match self.measurement_count {
            0 => {
                self.offset_us = offset_us;
                self.p.p00 = measurement_variance_us2;
                self.baseline_client_us = client_us;
                self.drift = 0.0;
                self.last_update_us = client_us;
                self.push_recent_offset(offset_us);
                self.measurement_count = 1;
                MeasurementOutcome::Accepted
            }
            1 => {
                let y = offset_us - self.offset_us;
                let s = self.p.p00 + measurement_variance_us2;
                let k0 = if s > 0.0 { self.p.p00 / s } else { 0.0 };
                self.offset_us += k0 * y;
                self.p.p00 = (1.0 - k0) * self.p.p00;
                self.p.p11 = 1.0e-8;
                self.p.p01 = 0.0;
                self.measurement_count = 2;
                self.last_update_us = client_us;
                self.push_recent_offset(self.offset_us);
                MeasurementOutcome::Accepted
            }
            _ => self.update_steady_state(offset_us, measurement_variance_us2, client_us),
        }
    }

    fn update_steady_state(
        &mut self,
        offset_us: f64,
        measurement_variance_us2: f64,
        client_us: i64,
    ) -> MeasurementOutcome {
        let within_outlier_guard_window = self.measurement_count < 5;
        if !within_outlier_guard_window
            && self.consecutive_rejections < OUTLIER_FORCE_ACCEPT_STREAK
            && !self.passes_outlier_gate(offset_us, measurement_variance_us2)
        {
            self.consecutive_rejections += 1;
            return MeasurementOutcome::Rejected;
        }
        self.consecutive_rejections = 0;

        let dt = (client_us - self.last_update_us) as f64 / 1_000_000.0;
        let dt = dt.max(0.0);

        // Predict.
        let offset_pred = self.offset_us + self.drift * dt;
        let fp00 = self.p.p00 + dt * self.p.p01;
        let fp01 = self.p.p01 + dt * self.p.p11;
        let fp10 = self.p.p01;
        let fp11 = self.p.p11;
        let mut p_pred00 = fp00 + dt * fp01;
        let p_pred01 = fp01;
        let p_pred10 = fp10 + dt * fp11;
        let p_pred11 = fp11;
        p_pred00 += self.adaptive_q * dt;

        let y = offset_us - offset_pred;

        // Adaptive forgetting: inflate covariance ahead of the update when
        // the innovation is large relative to the measurement's own error.
        let (mut p_pred00, mut p_pred01, mut p_pred10, p_pred11) =
            (p_pred00, p_pred01, p_pred10, p_pred11);
        if self.warmup_complete && y.abs() > 0.75 * measurement_variance_us2.sqrt() {
            p_pred00 *= ADAPTIVE_FORGETTING_FACTOR;
            p_pred01 *= ADAPTIVE_FORGETTING_FACTOR;
            p_pred10 *= ADAPTIVE_FORGETTING_FACTOR;
        }

        let s = p_pred00 + measurement_variance_us2;
        let (k0, k1) = if s > 0.0 {
            (p_pred00 / s, p_pred10 / s)
        } else {
            (0.0, 0.0)
        };

        self.offset_us = offset_pred + k0 * y;
        self.drift = (self.drift + k1 * y).clamp(-DRIFT_CLAMP, DRIFT_CLAMP);

        let new00 = (1.0 - k0) * p_pred00;
        let new01 = (1.0 - k0) * p_pred01;
        let new10 = p_pred10 - k1 * p_pred00;
        let new11 = p_pred11 - k1 * p_pred01;
        self.p.p00 = new00.max(0.0);
        self.p.p01 = (new01 + new10) / 2.0;
        self.p.p11 = new11.max(0.0);

        // Adaptive process noise from the normalized innovation.
        if s > 0.0 {
            let ratio = (y * y) / s;
            if self.innovation_window.len() == INNOVATION_WINDOW_CAPACITY {
                self.innovation_window.pop_front();
            }
            self.innovation_window.push_back(ratio);
            let mean_ratio: f64 =
                self.innovation_window.iter().sum::<f64>() / self.innovation_window.len() as f64;
            self.adaptive_q = Q_BASE_US2_PER_S * mean_ratio.clamp(Q_RATIO_MIN, Q_RATIO_MAX);
        }

        self.measurement_count += 1;
        self.last_update_us = client_us;
        self.push_recent_offset(self.offset_us);

        if !self.warmup_complete {
            let stddev = self.p.p00.sqrt();
            if (self.measurement_count >= WARMUP_MEASUREMENT_FLOOR
                && stddev < WARMUP_STDDEV_CEILING_US)
                || self.measurement_count >= WARMUP_MEASUREMENT_CAP
            {
                self.warmup_complete = true;
            }
        }

        MeasurementOutcome::Accepted
    }

    fn passes_outlier_gate(&self, offset_us: f64, measurement_variance_us2: f64) -> bool {
        if self.recent_offsets.len() < 2 {
            return true;
        }
        let mut sorted: Vec<f64> = self.recent_offsets.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = percentile(&sorted, 0.5);
        let q1 = percentile(&sorted, 0.25);
        let q3 = percentile(&sorted, 0.75);
        let iqr = (q3 - q1).abs();
        let bound = (3.0 * iqr).max(measurement_variance_us2.sqrt());
        (offset_us - median).abs() <= bound
    }

    fn push_recent_offset(&mut self, offset_us: f64) {
        if self.recent_offsets.len() == RECENT_OFFSETS_CAPACITY {
            self.recent_offsets.pop_front();
        }
        self.recent_offsets.push_back(offset_us);
    }

    /// Snapshots the current belief so a reconnect can later `thaw()` back
    /// into it instead of re-learning from zero. No-op if the filter isn't
    /// ready yet.
    pub fn freeze(&mut self) {
        if !self.is_ready() {
            return;
        }
        self.frozen = Some(FilterSnapshot {
            offset_us: self.offset_us,
            drift: self.drift,
            p: self.p,
            measurement_count: self.measurement_count,
            baseline_client_us: self.baseline_client_us,
            last_update_us: self.last_update_us,
            static_delay_us: self.static_delay_us,
            adaptive_q: self.adaptive_q,
            warmup_complete: self.warmup_complete,
        });
    }

    /// Restores a previously `freeze()`d belief, inflating its covariance
    /// to reflect the uncertainty accumulated since the snapshot was taken.
    /// No-op if nothing was frozen.
    pub fn thaw(&mut self) {
        let Some(snapshot) = self.frozen.take() else {
            return;
        };
        self.offset_us = snapshot.offset_us;
        self.drift = snapshot.drift;
        self.p = Covariance {
            p00: snapshot.p.p00 * 10.0,
            p01: snapshot.p.p01 * 3.0,
            p11: snapshot.p.p11 * 10.0,
        };
        self.measurement_count = snapshot.measurement_count;
        self.baseline_client_us = snapshot.baseline_client_us;
        self.last_update_us = snapshot.last_update_us;
        self.static_delay_us = snapshot.static_delay_us;
        self.adaptive_q = snapshot.adaptive_q;
        self.warmup_complete = snapshot.warmup_complete;
        self.recent_offsets.clear();
        self.innovation_window.clear();
        self.consecutive_rejections = 0;
    }

    pub fn has_frozen_snapshot(&self) -> bool {
        self.frozen.is_some()
    }

    /// Converts a server-clock timestamp to the local client clock using
    /// the learned offset only — drift is never applied across this call,
    /// it exists purely to keep the offset estimate current between
    /// measurements.
    pub fn server_to_client(&self, server_us: i64) -> i64 {
        (server_us as f64 - self.offset_us + self.static_delay_us).round() as i64
    }

    pub fn client_to_server(&self, client_us: i64) -> i64 {
        (client_us as f64 + self.offset_us - self.static_delay_us).round() as i64
    }

    pub fn is_ready(&self) -> bool {
        self.measurement_count >= 2 && self.p.p00.is_finite()
    }

    pub fn is_converged(&self) -> bool {
        self.measurement_count >= CONVERGED_MIN_MEASUREMENTS
            && self.p.p00.is_finite()
            && self.p.p00.sqrt() < CONVERGED_STDDEV_CEILING_US
    }

    pub fn state(&self) -> FilterState {
        FilterState {
            offset_us: self.offset_us,
            drift_ppm: self.drift * 1.0e6,
            offset_stddev_us: if self.p.p00.is_finite() {
                self.p.p00.sqrt()
            } else {
                f64::INFINITY
            },
            measurement_count: self.measurement_count,
            is_ready: self.is_ready(),
            is_converged: self.is_converged(),
        }
    }
}

/// Linear-interpolated percentile over an already-sorted slice.
fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = fraction * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = idx - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_measurement_sets_offset_directly() {
        let mut filter = TimeFilter::new();
        assert!(!filter.is_ready());
        let outcome = filter.add_measurement(1000.0, 10.0, 0, 20_000);
        assert_eq!(outcome, MeasurementOutcome::Accepted);
        assert!(!filter.is_ready());
    }

    #[test]
    fn becomes_ready_after_two_measurements() {
        let mut filter = TimeFilter::new();
        filter.add_measurement(1000.0, 10.0, 0, 20_000);
        filter.add_measurement(1010.0, 10.0, 100_000, 20_000);
        assert!(filter.is_ready());
    }

    #[test]
    fn converges_on_stable_offset() {
        let mut filter = TimeFilter::new();
        let mut t = 0i64;
        for _ in 0..60 {
            filter.add_measurement(5000.0, 5.0, t, 20_000);
            t += 100_000;
        }
        assert!(filter.is_converged());
        let state = filter.state();
        assert!((state.offset_us - 5000.0).abs() < 50.0);
    }

    #[test]
    fn outlier_is_rejected_without_disturbing_offset() {
        let mut filter = TimeFilter::new();
        let mut t = 0i64;
        for _ in 0..20 {
            filter.add_measurement(5000.0, 5.0, t, 20_000);
            t += 100_000;
        }
        let offset_before = filter.state().offset_us;
        let outcome = filter.add_measurement(500_000.0, 5.0, t, 20_000);
        assert_eq!(outcome, MeasurementOutcome::Rejected);
        assert_eq!(filter.state().offset_us, offset_before);
    }

    #[test]
    fn three_consecutive_outliers_force_accept_the_fourth() {
        let mut filter = TimeFilter::new();
        let mut t = 0i64;
        for _ in 0..20 {
            filter.add_measurement(5000.0, 5.0, t, 20_000);
            t += 100_000;
        }
        for _ in 0..3 {
            let outcome = filter.add_measurement(500_000.0, 5.0, t, 20_000);
            assert_eq!(outcome, MeasurementOutcome::Rejected);
            t += 100_000;
        }
        let outcome = filter.add_measurement(500_000.0, 5.0, t, 20_000);
        assert_eq!(outcome, MeasurementOutcome::Accepted);
    }

    #[test]
    fn server_to_client_and_back_round_trip_without_drift() {
        let mut filter = TimeFilter::new();
        let mut t = 0i64;
        for _ in 0..10 {
            filter.add_measurement(2_500.0, 5.0, t, 20_000);
            t += 100_000;
        }
        let server_us = 10_000_000i64;
        let client_us = filter.server_to_client(server_us);
        let back = filter.client_to_server(client_us);
        assert!((back - server_us).abs() <= 1);
    }

    #[test]
    fn freeze_then_thaw_restores_offset_and_inflates_covariance() {
        let mut filter = TimeFilter::new();
        let mut t = 0i64;
        for _ in 0..30 {
            filter.add_measurement(5000.0, 5.0, t, 20_000);
            t += 100_000;
        }
        let offset_before = filter.state().offset_us;
        let stddev_before = filter.state().offset_stddev_us;
        filter.freeze();
        assert!(filter.has_frozen_snapshot());
        filter.thaw();
        assert!(!filter.has_frozen_snapshot());
        assert_eq!(filter.state().offset_us, offset_before);
        assert!(filter.state().offset_stddev_us > stddev_before);
    }

    #[test]
    fn freeze_before_ready_is_a_no_op() {
        let mut filter = TimeFilter::new();
        filter.add_measurement(1000.0, 10.0, 0, 20_000);
        filter.freeze();
        assert!(!filter.has_frozen_snapshot());
    }

    #[test]
    fn single_outlier_amid_steady_offsets_is_rejected_and_offset_holds() {
        let mut filter = TimeFilter::new();
        let offsets = [10000.0, 10050.0, 9950.0, 10020.0, 9980.0, 500000.0, 10010.0];
        let mut t = 0i64;
        let mut outcomes = Vec::with_capacity(offsets.len());
        for offset in offsets {
            outcomes.push(filter.add_measurement(offset, 5000.0, t, 20_000));
            t += 100_000;
        }
        assert_eq!(outcomes[5], MeasurementOutcome::Rejected);
        assert!((filter.state().offset_us - 10000.0).abs() < 1000.0);
    }

    #[test]
    fn reset_clears_static_delay() {
        let mut filter = TimeFilter::new();
        filter.set_static_delay_us(1500.0);
        filter.add_measurement(1000.0, 10.0, 0, 20_000);
        filter.reset();
        assert_eq!(filter.static_delay_us(), 0.0);
        assert_eq!(filter.state().measurement_count, 0);
    }
}
