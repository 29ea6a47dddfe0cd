use std::sync::Arc;

use rhsdaq::buffers::RingBufferEngine;
use rhsdaq::config::BufferConfig;
use rhsdaq::core::{MultiProbeFrame, SyncedCycle};
use rhsdaq::observability::StageMetrics;
use rhsdaq::spikes::{EdgeMode, SpikeConfig, SpikeDetector, SpikeStore};

const W: usize = 20;

fn engine(num_probes: usize) -> RingBufferEngine {
    let config = BufferConfig {
        dense_samples: 2000,
        sparse_samples: 2000,
        sparse_decimation: 1,
        stats_interval_ms: 1000,
    };
    RingBufferEngine::new(num_probes, &config, Arc::new(StageMetrics::new("buffers"))).unwrap()
}

fn push_until(engine: &RingBufferEngine, end: u64, value: impl Fn(usize, u64) -> f32) {
    while engine.dense_count() < end {
        let count = engine.dense_count();
        let mut frame = MultiProbeFrame::new(count, engine.num_probes());
        for probe in 0..engine.num_probes() {
            frame.ac_uv[probe] = value(probe, count);
        }
        frame.clock_ticks = count;
        engine.push(&SyncedCycle {
            frame,
            raw_payload: Vec::new(),
            wall_clock_ns: 0,
        });
    }
}

fn background(count: u64) -> f32 {
    if count % 2 == 0 {
        1.0
    } else {
        -1.0
    }
}

fn config() -> SpikeConfig {
    SpikeConfig {
        edge: EdgeMode::Falling,
        waveform_length_samples: W,
        pre_samples: 5,
        min_sample_offset: 2,
        ..SpikeConfig::default()
    }
}

/// Dips every 7 samples on probe 0 between 200 and 300
fn train(probe: usize, count: u64) -> f32 {
    if probe == 0 && (200..300).contains(&count) && (count - 200) % 7 == 0 {
        -50.0
    } else {
        background(count)
    }
}

#[test]
fn test_refractory_period_between_spikes() {
    let engine = engine(2);
    push_until(&engine, 100, |_, c| background(c));
    engine.recompute_thresholds();
    push_until(&engine, 400, train);

    let mut detector = SpikeDetector::new(2, config(), Arc::new(StageMetrics::new("spikes")));
    let spikes = detector.process(&engine);

    let counts: Vec<u64> = spikes.iter().map(|s| s.sample_count).collect();
    assert_eq!(counts, vec![200, 221, 242, 263, 284]);
    for pair in counts.windows(2) {
        assert!(pair[1] - pair[0] >= W as u64);
    }
    assert!(spikes.iter().all(|s| s.probe == 0));
    assert!(spikes.iter().all(|s| s.waveform.len() == W && s.min_offset == 5));
}

#[test]
fn test_streaming_matches_single_pass() {
    let engine = engine(2);
    push_until(&engine, 100, |_, c| background(c));
    engine.recompute_thresholds();

    let mut detector = SpikeDetector::new(2, config(), Arc::new(StageMetrics::new("spikes")));
    let mut counts = Vec::new();
    for end in (110..=400).step_by(13) {
        push_until(&engine, end, train);
        counts.extend(detector.process(&engine).into_iter().map(|s| s.sample_count));
    }
    push_until(&engine, 400, train);
    counts.extend(detector.process(&engine).into_iter().map(|s| s.sample_count));

    assert_eq!(counts, vec![200, 221, 242, 263, 284]);
}

#[test]
fn test_store_collects_history_and_bursts() {
    let engine = engine(2);
    push_until(&engine, 100, |_, c| background(c));
    engine.recompute_thresholds();
    push_until(&engine, 400, train);

    let cfg = config();
    let mut detector = SpikeDetector::new(2, cfg.clone(), Arc::new(StageMetrics::new("spikes")));
    // one-second burst windows of 100 samples
    let mut store = SpikeStore::new(2, 100.0, &cfg);
    for spike in detector.process(&engine) {
        store.push(spike);
    }
    store.advance_to(400);

    assert_eq!(store.total(), 5);
    assert_eq!(store.history_for(0).len(), 5);
    assert!(store.history_for(1).is_empty());
    assert_eq!(store.diagnostics().len(), 5);

    let bursts = store.burst_snapshot();
    assert!((bursts.rates_hz[0] - 1.25).abs() < 1e-9);
    assert_eq!(bursts.rates_hz[1], 0.0);
    assert_eq!(bursts.current_counts, vec![0, 0]);
}

#[test]
fn test_spikes_marked_in_dense_buffer() {
    let engine = engine(2);
    push_until(&engine, 100, |_, c| background(c));
    engine.recompute_thresholds();
    push_until(&engine, 400, train);

    SpikeDetector::new(2, config(), Arc::new(StageMetrics::new("spikes"))).process(&engine);
    engine.with_dense(|ring| {
        assert_eq!(ring.spike_at(0, 221), Some(true));
        assert_eq!(ring.spike_at(0, 207), Some(false));
        assert_eq!(ring.spike_at(1, 221), Some(false));
    });
}
