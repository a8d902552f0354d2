//! Server simulator for testing clock synchronization.
//!
//! Provides in-process simulation of a Sendspin server's probe responses and
//! media chunks, with configurable clock offset, network jitter, and loss
//! for deterministic testing.

use rand::Rng;
use sendspin_common::{CodecTag, MediaFrame};

/// Server simulator configuration.
#[derive(Debug, Clone)]
pub struct ServerSimulatorConfig {
    // ---
    /// True server-minus-client clock offset (µs).
    pub clock_offset_us: i64,

    /// One-way base network delay (µs).
    pub base_delay_us: i64,

    /// Extra random delay per direction, 0..=jitter (µs).
    pub jitter_us: i64,

    /// Server-side probe processing time (µs).
    pub server_proc_us: i64,

    /// Probe loss rate (0.0 to 1.0).
    pub loss_rate: f64,

    /// Random seed for deterministic testing.
    pub seed: Option<u64>,
}

impl Default for ServerSimulatorConfig {
    fn default() -> Self {
        // ---
        Self {
            clock_offset_us: 10_000_000,
            base_delay_us: 100,
            jitter_us: 50,
            server_proc_us: 50,
            loss_rate: 0.0,
            seed: None,
        }
    }
}

/// A simulated probe response quadruple completion.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReply {
    // ---
    /// Server receive time (server domain, µs).
    pub s1_us: i64,

    /// Server transmit time (server domain, µs).
    pub s2_us: i64,

    /// Local receive time of the response (client domain, µs).
    pub t3_us: i64,
}

/// Simulates a Sendspin server's clock and media output.
pub struct ServerSimulator {
    // ---
    config: ServerSimulatorConfig,
    rng: rand::rngs::StdRng,
    probes_answered: u64,
    probes_lost: u64,
}

impl ServerSimulator {
    // ---
    /// Creates a new simulator with the given configuration.
    pub fn new(config: ServerSimulatorConfig) -> Self {
        // ---
        use rand::SeedableRng;

        let rng = if let Some(seed) = config.seed {
            rand::rngs::StdRng::seed_from_u64(seed)
        } else {
            rand::rngs::StdRng::from_entropy()
        };

        Self {
            config,
            rng,
            probes_answered: 0,
            probes_lost: 0,
        }
    }

    /// Answers a probe transmitted at local time `t0_us`.
    ///
    /// Returns `None` when the probe (or its response) was lost.
    pub fn answer_probe(&mut self, t0_us: i64) -> Option<ProbeReply> {
        // ---
        if self.config.loss_rate > 0.0 && self.rng.gen_bool(self.config.loss_rate) {
            self.probes_lost += 1;
            return None;
        }

        let up = self.config.base_delay_us + self.jitter();
        let down = self.config.base_delay_us + self.jitter();

        let s1_us = t0_us + up + self.config.clock_offset_us;
        let s2_us = s1_us + self.config.server_proc_us;
        let t3_us = t0_us + up + self.config.server_proc_us + down;

        self.probes_answered += 1;

        Some(ProbeReply {
            s1_us,
            s2_us,
            t3_us,
        })
    }

    /// Produces a silent 16-bit PCM chunk dated in the server domain.
    pub fn pcm_chunk(
        &mut self,
        presentation_ts_server_us: i64,
        sample_frames: usize,
        channels: usize,
    ) -> MediaFrame {
        // ---
        MediaFrame::new(
            presentation_ts_server_us,
            CodecTag::Pcm,
            vec![0u8; sample_frames * channels * 2],
        )
    }

    /// (answered, lost) probe counts.
    pub fn probe_stats(&self) -> (u64, u64) {
        // ---
        (self.probes_answered, self.probes_lost)
    }

    fn jitter(&mut self) -> i64 {
        // ---
        if self.config.jitter_us == 0 {
            0
        } else {
            self.rng.gen_range(0..=self.config.jitter_us)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_probe_reply_is_consistent() {
        // ---
        let mut sim = ServerSimulator::new(ServerSimulatorConfig {
            seed: Some(42),
            ..Default::default()
        });

        let reply = sim.answer_probe(1_000_000).expect("probe lost");

        assert!(reply.s2_us >= reply.s1_us);
        assert!(reply.t3_us > 1_000_000);

        // The midpoint measurement recovers roughly the configured offset.
        let measurement = (reply.s1_us + reply.s2_us) / 2 - (1_000_000 + reply.t3_us) / 2;
        assert!((measurement - 10_000_000).abs() <= 100);
    }

    #[test]
    fn test_probe_loss_is_deterministic() {
        // ---
        let config = ServerSimulatorConfig {
            loss_rate: 0.5,
            seed: Some(42),
            ..Default::default()
        };

        let mut sim1 = ServerSimulator::new(config.clone());
        let mut sim2 = ServerSimulator::new(config);

        for i in 0..100i64 {
            sim1.answer_probe(i * 1_000_000);
            sim2.answer_probe(i * 1_000_000);
        }

        assert_eq!(sim1.probe_stats(), sim2.probe_stats());

        let (answered, lost) = sim1.probe_stats();
        assert!(lost > 20 && lost < 80);
        assert_eq!(answered + lost, 100);
    }

    #[test]
    fn test_pcm_chunk_sizing() {
        // ---
        let mut sim = ServerSimulator::new(ServerSimulatorConfig::default());

        let chunk = sim.pcm_chunk(5_000_000, 960, 2);
        assert_eq!(chunk.presentation_ts_us, 5_000_000);
        assert_eq!(chunk.payload.len(), 960 * 2 * 2);
    }
}
