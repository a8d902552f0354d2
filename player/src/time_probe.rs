//! NTP-style probe bookkeeping.
//!
//! The session task transmits a probe every second until the clock filter
//! converges, then every five seconds to track drift. Responses are matched
//! to outstanding probes by the echoed `t0`; anything older than the probe
//! timeout is discarded.

use std::collections::HashSet;
use std::time::Duration;

use sendspin_common::ClientMessage;

use crate::time_filter::TimeFilter;

/// Probe cadence before the filter converges.
pub const PROBE_INTERVAL_UNSYNCED: Duration = Duration::from_millis(1_000);

/// Probe cadence once the filter converged.
pub const PROBE_INTERVAL_SYNCED: Duration = Duration::from_millis(5_000);

/// Responses older than this are discarded.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Tracks outstanding clock probes for one connection.
#[derive(Debug, Default)]
pub struct ProbeDriver {
    // ---
    /// Local transmit times of probes still awaiting a response.
    outstanding: HashSet<i64>,

    /// Round trip of the last accepted response (µs).
    last_round_trip_us: Option<i64>,
}

impl ProbeDriver {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Starts a probe at `now_local_us`, returning the frame to transmit.
    pub fn begin(&mut self, now_local_us: i64) -> ClientMessage {
        // ---
        self.expire(now_local_us);
        self.outstanding.insert(now_local_us);

        ClientMessage::TimeProbe {
            t0_us: now_local_us,
        }
    }

    /// Handles a probe response received at `now_local_us`.
    ///
    /// Feeds the filter and returns `true` when the response matched a live
    /// probe; unknown or timed-out responses are dropped.
    pub fn on_response(
        &mut self,
        t0_us: i64,
        s1_us: i64,
        s2_us: i64,
        now_local_us: i64,
        filter: &mut TimeFilter,
    ) -> bool {
        // ---
        self.expire(now_local_us);

        if !self.outstanding.remove(&t0_us) {
            return false;
        }

        self.last_round_trip_us = Some((now_local_us - t0_us).max(0));
        filter.on_server_time(t0_us, now_local_us, s1_us, s2_us);
        true
    }

    /// Probe cadence for the filter's current convergence state.
    pub fn interval(filter: &TimeFilter) -> Duration {
        // ---
        if filter.has_converged() {
            PROBE_INTERVAL_SYNCED
        } else {
            PROBE_INTERVAL_UNSYNCED
        }
    }

    /// Round trip of the last accepted response (µs).
    pub fn last_round_trip_us(&self) -> Option<i64> {
        // ---
        self.last_round_trip_us
    }

    /// Drops all in-flight probes (connection teardown).
    pub fn clear(&mut self) {
        // ---
        self.outstanding.clear();
        self.last_round_trip_us = None;
    }

    /// Forgets probes older than the timeout.
    fn expire(&mut self, now_local_us: i64) {
        // ---
        let timeout_us = PROBE_TIMEOUT.as_micros() as i64;
        self.outstanding.retain(|&t0| now_local_us - t0 <= timeout_us);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_response_matches_outstanding_probe() {
        // ---
        let mut driver = ProbeDriver::new();
        let mut filter = TimeFilter::new();

        let msg = driver.begin(1_000);
        assert_eq!(msg, ClientMessage::TimeProbe { t0_us: 1_000 });

        let accepted = driver.on_response(1_000, 11_100, 11_150, 1_200, &mut filter);
        assert!(accepted);
        assert_eq!(driver.last_round_trip_us(), Some(200));
        assert_eq!(filter.measurements(), 1);
    }

    #[test]
    fn test_unknown_response_dropped() {
        // ---
        let mut driver = ProbeDriver::new();
        let mut filter = TimeFilter::new();

        let accepted = driver.on_response(42, 11_100, 11_150, 200, &mut filter);
        assert!(!accepted);
        assert_eq!(filter.measurements(), 0);
    }

    #[test]
    fn test_timed_out_response_dropped() {
        // ---
        let mut driver = ProbeDriver::new();
        let mut filter = TimeFilter::new();

        driver.begin(0);

        // Response arrives 3.5 s later: past the probe timeout.
        let accepted = driver.on_response(0, 11_100, 11_150, 3_500_000, &mut filter);
        assert!(!accepted);
        assert_eq!(filter.measurements(), 0);
    }

    #[test]
    fn test_duplicate_response_dropped() {
        // ---
        let mut driver = ProbeDriver::new();
        let mut filter = TimeFilter::new();

        driver.begin(0);
        assert!(driver.on_response(0, 11_100, 11_150, 200, &mut filter));
        assert!(!driver.on_response(0, 11_100, 11_150, 300, &mut filter));
        assert_eq!(filter.measurements(), 1);
    }

    #[test]
    fn test_interval_tracks_convergence() {
        // ---
        let mut filter = TimeFilter::new();
        assert_eq!(ProbeDriver::interval(&filter), PROBE_INTERVAL_UNSYNCED);

        for i in 0..15i64 {
            let t0 = i * 1_000_000;
            filter.on_server_time(t0, t0 + 200, t0 + 10_100, t0 + 10_110);
        }
        assert_eq!(ProbeDriver::interval(&filter), PROBE_INTERVAL_SYNCED);
    }
}
