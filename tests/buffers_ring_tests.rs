use std::sync::Arc;

use rhsdaq::buffers::{MirroredChannel, ProbeStatistics, RingBufferEngine, SampleRing};
use rhsdaq::config::BufferConfig;
use rhsdaq::core::{MultiProbeFrame, SyncedCycle};
use rhsdaq::observability::StageMetrics;

fn frame(count: u64, num_probes: usize, value: impl Fn(usize) -> f32) -> MultiProbeFrame {
    let mut frame = MultiProbeFrame::new(count, num_probes);
    for probe in 0..num_probes {
        frame.ac_uv[probe] = value(probe);
        frame.dc_mv[probe] = -value(probe);
    }
    frame.clock_ticks = count;
    frame
}

#[test]
fn test_mirror_invariant_after_any_pushes() {
    let size = 7;
    for pushes in [0usize, 1, 6, 7, 8, 20, 50] {
        let mut channel = MirroredChannel::<f32>::new(size);
        for n in 0..pushes {
            channel.write(n, n as f32 * 0.5);
        }

        let raw = channel.raw();
        assert_eq!(raw.len(), 3 * size);
        for i in 0..size {
            assert_eq!(raw[i], raw[i + size], "pushes={} i={}", pushes, i);
            assert_eq!(raw[i], raw[i + 2 * size], "pushes={} i={}", pushes, i);
        }
    }
}

#[test]
fn test_ring_window_matches_history() {
    let mut ring = SampleRing::new(2, 16);
    for n in 0..40u64 {
        ring.push(&frame(n, 2, |p| (n * 10 + p as u64) as f32));
    }

    // last 16 samples are addressable, in order
    let window = ring.window(1, 24, 16).unwrap();
    let expected: Vec<f32> = (24..40u64).map(|n| (n * 10 + 1) as f32).collect();
    assert_eq!(window, expected.as_slice());

    assert!(ring.window(1, 23, 16).is_none());
    assert!(ring.window(1, 30, 11).is_none());
    assert_eq!(ring.dc_window(0, 39, 1).unwrap(), &[-390.0]);
}

#[test]
fn test_constant_sparse_buffer_statistics() {
    let config = BufferConfig {
        dense_samples: 300,
        sparse_samples: 50,
        sparse_decimation: 3,
        stats_interval_ms: 1000,
    };
    let engine = RingBufferEngine::new(4, &config, Arc::new(StageMetrics::new("buffers"))).unwrap();

    for n in 0..600u64 {
        engine.push(&SyncedCycle {
            frame: frame(n, 4, |p| 12.5 + p as f32),
            raw_payload: Vec::new(),
            wall_clock_ns: 0,
        });
    }
    assert_eq!(engine.sparse_count(), 200);

    let stats = engine.recompute_thresholds();
    for (probe, s) in stats.iter().enumerate() {
        assert_eq!(s.count, 50);
        assert!((s.mean - (12.5 + probe as f64)).abs() < 1e-9);
        assert_eq!(s.deviation, 0.0);
        assert_eq!(s.variance, 0.0);
    }
    assert_eq!(engine.probe_stats(), stats);
}

#[test]
fn test_statistics_use_sample_variance() {
    let stats = ProbeStatistics::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    assert_eq!(stats.mean, 5.0);
    assert_eq!(stats.sum_sq_dev, 32.0);
    assert!((stats.variance - 32.0 / 7.0).abs() < 1e-12);
}
