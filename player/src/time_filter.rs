//! Clock offset estimation between this client and the server.
//!
//! A two-state Kalman filter tracks the server-minus-client offset and its
//! drift rate from NTP-style probe exchanges. Playout must gate on
//! [`TimeFilter::has_converged`]; before that the estimate can jump by more
//! than a chunk duration and would produce audible artifacts.

use tracing::debug;

/// Measurements required before convergence may be declared.
const MIN_CONVERGED_MEASUREMENTS: u32 = 12;

/// Offset standard error below which the filter counts as converged (µs).
const CONVERGED_ERROR_US: f64 = 5_000.0;

/// Measurement count after which adaptive forgetting kicks in.
const FORGET_AFTER_MEASUREMENTS: u32 = 100;

/// Residual-to-error ratio that triggers covariance inflation.
const RESIDUAL_FORGET_RATIO: f64 = 0.75;

/// Floor on the per-probe measurement error (µs).
const MIN_MEASUREMENT_ERROR_US: f64 = 100.0;

/// Two-state Kalman filter over (offset, drift).
///
/// Offset is `server_time - client_time` in microseconds at `last_update`;
/// drift is its rate of change in µs per µs. The filter never fails on bad
/// input: negative errors and reversed round trips are clamped to zero and
/// callers gate on the convergence queries instead.
#[derive(Debug, Clone)]
pub struct TimeFilter {
    // ---
    /// Estimated server minus client offset at `last_update` (µs).
    offset_us: f64,

    /// Estimated drift (µs per µs).
    drift: f64,

    /// Covariance over (offset, drift). `cov[0][0]` starts at infinity.
    cov: [[f64; 2]; 2],

    /// Number of applied measurements, saturating at the forgetting
    /// threshold.
    count: u32,

    /// Local time of the last applied measurement (µs).
    last_update: i64,

    /// Latched once the convergence condition first holds.
    converged: bool,

    /// Process noise applied to the offset per microsecond of prediction.
    process_std_dev: f64,

    /// Covariance inflation factor for surprising residuals.
    forget_factor: f64,
}

impl TimeFilter {
    // ---
    /// Creates a filter with the default process noise and forgetting factor.
    pub fn new() -> Self {
        // ---
        Self::with_params(0.01, 1.001)
    }

    /// Creates a filter with explicit parameters.
    pub fn with_params(process_std_dev: f64, forget_factor: f64) -> Self {
        // ---
        Self {
            offset_us: 0.0,
            drift: 0.0,
            cov: [[f64::INFINITY, 0.0], [0.0, 0.0]],
            count: 0,
            last_update: 0,
            converged: false,
            process_std_dev,
            forget_factor,
        }
    }

    /// Resets the filter to its initial state.
    pub fn reset(&mut self) {
        // ---
        let params = (self.process_std_dev, self.forget_factor);
        *self = Self::with_params(params.0, params.1);
    }

    /// Applies one offset measurement.
    ///
    /// `measurement_us` is an observed `server - client` offset,
    /// `max_error_us` its worst-case error, `time_added_local_us` the local
    /// time the observation completed. A measurement stamped at the same
    /// local time as the previous one is ignored.
    pub fn update(&mut self, measurement_us: f64, max_error_us: f64, time_added_local_us: i64) {
        // ---
        // Also rejects time running backwards, keeping `last_update`
        // monotonic.
        if self.count > 0 && time_added_local_us <= self.last_update {
            return;
        }

        let max_error = max_error_us.max(0.0);
        let r = max_error * max_error;

        match self.count {
            0 => {
                self.offset_us = measurement_us;
                self.drift = 0.0;
                self.cov[0][0] = r;
                self.count = 1;
            }
            1 => {
                let dt = (time_added_local_us - self.last_update) as f64;
                self.drift = (measurement_us - self.offset_us) / dt;
                self.cov[1][1] = (self.cov[0][0] + r) / dt;
                self.offset_us = measurement_us;
                self.cov[0][0] = r;
                self.count = 2;
            }
            _ => {
                self.kalman_step(measurement_us, max_error, r, time_added_local_us);
                if self.count < FORGET_AFTER_MEASUREMENTS {
                    self.count += 1;
                }
            }
        }

        self.last_update = time_added_local_us;

        if !self.converged
            && self.count >= MIN_CONVERGED_MEASUREMENTS
            && self.cov[0][0].sqrt() < CONVERGED_ERROR_US
        {
            self.converged = true;
            debug!(
                "clock converged: offset={:.0}us drift={:.2}ppm error={:.0}us",
                self.offset_us,
                self.estimated_drift_ppm(),
                self.estimated_error_us()
            );
        }
    }

    /// Standard predict/update step for the steady state (`count >= 2`).
    fn kalman_step(&mut self, measurement_us: f64, max_error: f64, r: f64, now_local_us: i64) {
        // ---
        let dt = (now_local_us - self.last_update) as f64;

        // Predict through F = [[1, dt], [0, 1]]; process noise on offset only.
        let predicted_offset = self.offset_us + self.drift * dt;
        let q = dt * self.process_std_dev * self.process_std_dev;

        let mut p00 = self.cov[0][0]
            + dt * (self.cov[0][1] + self.cov[1][0])
            + dt * dt * self.cov[1][1]
            + q;
        let mut p01 = self.cov[0][1] + dt * self.cov[1][1];
        let mut p10 = self.cov[1][0] + dt * self.cov[1][1];
        let mut p11 = self.cov[1][1];

        let residual = measurement_us - predicted_offset;

        // Adaptive forgetting: a surprising residual on a mature filter
        // inflates the predicted covariance before the update step.
        if self.count >= FORGET_AFTER_MEASUREMENTS
            && residual.abs() > RESIDUAL_FORGET_RATIO * max_error
        {
            let inflate = self.forget_factor * self.forget_factor;
            p00 *= inflate;
            p01 *= inflate;
            p10 *= inflate;
            p11 *= inflate;
        }

        // Update with H = [1, 0], R = max_error^2.
        let innovation_var = p00 + r;
        let k0 = p00 / innovation_var;
        let k1 = p10 / innovation_var;

        self.offset_us = predicted_offset + k0 * residual;
        self.drift += k1 * residual;

        self.cov[0][0] = (1.0 - k0) * p00;
        self.cov[0][1] = (1.0 - k0) * p01;
        self.cov[1][0] = p10 - k1 * p00;
        self.cov[1][1] = p11 - k1 * p01;
    }

    /// Ingests one NTP-style probe quadruple.
    ///
    /// `t0` local transmit, `s1` server receive, `s2` server transmit, `t3`
    /// local receive, all microseconds. Reversed intervals are clamped to
    /// zero rather than rejected.
    pub fn on_server_time(&mut self, t0: i64, t3: i64, s1: i64, s2: i64) {
        // ---
        let rtt = (t3 - t0).max(0);
        let server_proc = (s2 - s1).max(0);
        let one_way = ((rtt - server_proc) as f64 / 2.0).max(0.0);

        let measurement =
            (s1 as f64 + server_proc as f64 / 2.0) - (t0 as f64 + rtt as f64 / 2.0);
        let max_error = one_way.max(MIN_MEASUREMENT_ERROR_US);

        self.update(measurement, max_error, t3);
    }

    /// Converts a local timestamp into the server domain.
    ///
    /// Returns `None` until the filter is ready (two finite measurements).
    pub fn client_to_server(&self, t_local_us: i64) -> Option<i64> {
        // ---
        if !self.is_ready() {
            return None;
        }

        let t = t_local_us as f64;
        let projected = t + self.offset_us + self.drift * (t - self.last_update as f64);
        Some(projected.round() as i64)
    }

    /// Converts a server-domain timestamp into the local domain.
    ///
    /// Exact inverse of [`Self::client_to_server`] up to rounding.
    pub fn server_to_client(&self, t_server_us: i64) -> Option<i64> {
        // ---
        if !self.is_ready() {
            return None;
        }

        let denominator = 1.0 + self.drift;
        if denominator.abs() < f64::EPSILON {
            return None;
        }

        let projected = (t_server_us as f64 - self.offset_us
            + self.drift * self.last_update as f64)
            / denominator;
        Some(projected.round() as i64)
    }

    /// Whether timestamp conversions are meaningful at all.
    pub fn is_ready(&self) -> bool {
        // ---
        self.count >= 2 && self.cov[0][0].is_finite()
    }

    /// Whether enough low-variance measurements accumulated for playout.
    ///
    /// Latches true once reached; only [`Self::reset`] clears it.
    pub fn has_converged(&self) -> bool {
        // ---
        self.converged
    }

    /// Standard error of the offset estimate (µs).
    pub fn estimated_error_us(&self) -> f64 {
        // ---
        self.cov[0][0].sqrt()
    }

    /// Current offset estimate (µs).
    pub fn estimated_offset_us(&self) -> f64 {
        // ---
        self.offset_us
    }

    /// Current drift estimate in parts per million.
    pub fn estimated_drift_ppm(&self) -> f64 {
        // ---
        self.drift * 1e6
    }

    /// Number of applied measurements.
    pub fn measurements(&self) -> u32 {
        // ---
        self.count
    }
}

impl Default for TimeFilter {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_first_probe_bootstraps_offset() {
        // ---
        let mut filter = TimeFilter::new();
        filter.on_server_time(0, 200, 10_100, 10_150);

        // rtt=200, proc=50 -> measurement = 10125 - 100 = 10025.
        assert!((filter.estimated_offset_us() - 10_025.0).abs() < 0.5);
        assert_eq!(filter.estimated_drift_ppm(), 0.0);
        assert_eq!(filter.measurements(), 1);
        assert!(!filter.is_ready());
    }

    #[test]
    fn test_second_probe_establishes_drift() {
        // ---
        let mut filter = TimeFilter::new();
        filter.on_server_time(0, 200, 10_100, 10_150);
        filter.on_server_time(1_000_000, 1_000_240, 11_100_120, 11_100_170);

        // Second measurement = 11_100_145 - 1_000_120 = 10_100_025.
        assert!((filter.estimated_offset_us() - 10_100_025.0).abs() <= 1.0);
        assert!(filter.estimated_drift_ppm() > 0.0);
        assert!(filter.is_ready());
        assert!(!filter.has_converged());
    }

    #[test]
    fn test_converges_after_twelve_probes() {
        // ---
        let mut rng = StdRng::seed_from_u64(7);
        let mut filter = TimeFilter::new();

        const TRUE_OFFSET: i64 = 10_000;

        for i in 0..12i64 {
            let t0 = i * 1_000_000;
            let rtt = rng.gen_range(100..=300);
            let noise = rng.gen_range(-50..=50);

            let s1 = t0 + rtt / 2 + TRUE_OFFSET + noise;
            let s2 = s1 + 10;
            let t3 = t0 + rtt + 10;

            filter.on_server_time(t0, t3, s1, s2);
        }

        assert!(filter.has_converged());
        assert!(filter.estimated_error_us() < CONVERGED_ERROR_US);
        assert!((filter.estimated_offset_us() - TRUE_OFFSET as f64).abs() <= 300.0);
    }

    #[test]
    fn test_conversion_roundtrip_within_tolerance() {
        // ---
        let mut filter = TimeFilter::new();
        filter.on_server_time(0, 200, 10_100, 10_150);
        filter.on_server_time(1_000_000, 1_000_200, 1_010_100, 1_010_150);

        for t_local in [0i64, 1_234_567, 5_000_000, 987_654_321] {
            let t_server = filter.client_to_server(t_local).expect("filter ready");
            let back = filter.server_to_client(t_server).expect("filter ready");
            assert!(
                (back - t_local).abs() <= 2,
                "roundtrip drifted: {} -> {} -> {}",
                t_local,
                t_server,
                back
            );
        }
    }

    #[test]
    fn test_conversion_unready_returns_none() {
        // ---
        let filter = TimeFilter::new();
        assert_eq!(filter.client_to_server(1_000), None);
        assert_eq!(filter.server_to_client(1_000), None);
    }

    #[test]
    fn test_duplicate_timestamp_is_noop() {
        // ---
        let mut filter = TimeFilter::new();
        filter.on_server_time(0, 200, 10_100, 10_150);
        filter.on_server_time(1_000_000, 1_000_200, 1_010_100, 1_010_150);

        let before = filter.clone();
        filter.update(99_999.0, 100.0, 1_000_200);

        assert_eq!(filter.estimated_offset_us(), before.estimated_offset_us());
        assert_eq!(filter.measurements(), before.measurements());
    }

    #[test]
    fn test_reversed_rtt_clamped() {
        // ---
        let mut filter = TimeFilter::new();

        // t3 < t0 and s2 < s1; both intervals clamp to zero instead of
        // producing a negative error.
        filter.on_server_time(1_000, 500, 10_100, 10_050);
        assert_eq!(filter.measurements(), 1);
    }

    #[test]
    fn test_reset_clears_convergence() {
        // ---
        let mut filter = TimeFilter::new();
        for i in 0..15i64 {
            let t0 = i * 1_000_000;
            filter.on_server_time(t0, t0 + 200, t0 + 10_100, t0 + 10_110);
        }
        assert!(filter.has_converged());

        filter.reset();
        assert!(!filter.has_converged());
        assert!(!filter.is_ready());
        assert_eq!(filter.measurements(), 0);
    }

    #[test]
    fn test_count_saturates_at_forgetting_threshold() {
        // ---
        let mut filter = TimeFilter::new();
        for i in 0..200i64 {
            let t0 = i * 1_000_000;
            filter.on_server_time(t0, t0 + 200, t0 + 10_100, t0 + 10_110);
        }
        assert_eq!(filter.measurements(), FORGET_AFTER_MEASUREMENTS);
    }
}
