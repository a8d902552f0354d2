//! Integration tests for clock synchronization and timed playout.
//!
//! Drives the time filter and jitter buffer against the simulated server:
//! convergence under jitter and loss, late-chunk handling, and the ordering
//! guarantee of the playout path.

mod server_simulator;

use server_simulator::{ServerSimulator, ServerSimulatorConfig};

use sendspin_player::{JitterBuffer, JitterBufferConfig, TimeFilter};

/// Runs `probes` one-second-spaced probe exchanges through the simulator.
fn sync_against(sim: &mut ServerSimulator, filter: &mut TimeFilter, probes: usize) {
    // ---
    for i in 0..probes as i64 {
        let t0 = i * 1_000_000;
        if let Some(reply) = sim.answer_probe(t0) {
            filter.on_server_time(t0, reply.t3_us, reply.s1_us, reply.s2_us);
        }
    }
}

/// Converges the filter against the simulated server and returns it.
fn converged_filter(clock_offset_us: i64) -> TimeFilter {
    // ---
    let mut sim = ServerSimulator::new(ServerSimulatorConfig {
        clock_offset_us,
        seed: Some(7),
        ..Default::default()
    });

    let mut filter = TimeFilter::new();
    sync_against(&mut sim, &mut filter, 20);

    assert!(filter.has_converged(), "filter failed to converge");
    filter
}

/// Convergence under realistic jitter, with the offset recovered accurately.
#[test]
fn test_filter_converges_against_simulated_server() {
    // ---
    let filter = converged_filter(10_000_000);

    assert!((filter.estimated_offset_us() - 10_000_000.0).abs() <= 300.0);
    assert!(filter.estimated_error_us() < 5_000.0);

    println!(
        "✓ converged: offset={:.0}us err={:.0}us",
        filter.estimated_offset_us(),
        filter.estimated_error_us()
    );
}

/// Probe loss delays convergence but does not prevent it.
#[test]
fn test_filter_converges_despite_probe_loss() {
    // ---
    let mut sim = ServerSimulator::new(ServerSimulatorConfig {
        clock_offset_us: -2_500_000,
        jitter_us: 200,
        loss_rate: 0.3,
        seed: Some(42),
        ..Default::default()
    });

    let mut filter = TimeFilter::new();
    sync_against(&mut sim, &mut filter, 40);

    assert!(filter.has_converged());
    assert!((filter.estimated_offset_us() + 2_500_000.0).abs() <= 500.0);

    let (answered, lost) = sim.probe_stats();
    println!("✓ converged with {}/{} probes lost", lost, answered + lost);
}

/// Domain conversions invert each other after convergence.
#[test]
fn test_conversions_roundtrip_after_convergence() {
    // ---
    let filter = converged_filter(10_000_000);

    for t_local in [20_000_000i64, 21_234_567, 100_000_000] {
        let t_server = filter.client_to_server(t_local).expect("filter ready");
        let back = filter.server_to_client(t_server).expect("filter ready");
        assert!((back - t_local).abs() <= 2);
    }
}

/// A chunk already past its deadline is counted, never queued.
#[test]
fn test_late_chunk_dropped_against_synced_clock() {
    // ---
    let filter = converged_filter(10_000_000);

    let mut buffer = JitterBuffer::new(JitterBufferConfig {
        max_queued: 50,
        playout_offset_us: 0,
    });

    let now_local = 30_000_000i64;
    let server_now = filter.client_to_server(now_local).expect("filter ready");

    // 100 ms in the past, server domain.
    let mut sim = ServerSimulator::new(ServerSimulatorConfig::default());
    let chunk = sim.pcm_chunk(server_now - 100_000, 960, 2);

    let inserted = buffer.insert(
        sendspin_player::decode::DecodedFrame {
            presentation_ts_us: chunk.presentation_ts_us,
            duration_us: 20_000,
            pcm: chunk.payload,
        },
        Some(server_now),
    );

    assert!(!inserted);
    assert_eq!(buffer.late_drops(), 1);
    assert_eq!(buffer.queued_chunks(), 0);
}

/// Chunks inserted in scrambled order drain strictly ascending.
#[test]
fn test_playout_order_is_strictly_ascending() {
    // ---
    let filter = converged_filter(10_000_000);

    let mut buffer = JitterBuffer::new(JitterBufferConfig {
        max_queued: 50,
        playout_offset_us: 0,
    });

    let now_local = 30_000_000i64;
    let server_now = filter.client_to_server(now_local).expect("filter ready");

    // Scrambled arrival order, all future-dated.
    for step in [3i64, 0, 4, 1, 2] {
        buffer.insert(
            sendspin_player::decode::DecodedFrame {
                presentation_ts_us: server_now + 50_000 + step * 20_000,
                duration_us: 20_000,
                pcm: vec![0u8; 8],
            },
            Some(server_now),
        );
    }

    let mut last_ts = i64::MIN;
    let mut drained = 0;
    while let Some(frame) = buffer.pop_due(server_now + 1_000_000) {
        assert!(frame.presentation_ts_us > last_ts, "ordering violated");
        last_ts = frame.presentation_ts_us;
        drained += 1;
    }

    assert_eq!(drained, 5);
    println!("✓ {} chunks drained in strict timestamp order", drained);
}

/// A negative playout offset releases chunks ahead of their timestamp.
#[test]
fn test_negative_playout_offset_catches_up() {
    // ---
    let mut buffer = JitterBuffer::new(JitterBufferConfig {
        max_queued: 50,
        playout_offset_us: -200_000,
    });

    buffer.insert(
        sendspin_player::decode::DecodedFrame {
            presentation_ts_us: 1_100_000,
            duration_us: 20_000,
            pcm: vec![0u8; 8],
        },
        Some(850_000),
    );

    // Not due before the shifted instant of 900_000...
    assert!(buffer.pop_due(899_000).is_none());

    // ...then released 200 ms ahead of its presentation timestamp.
    assert!(buffer.pop_due(1_000_000).is_some());
}
