use std::sync::{Arc, Mutex};

use rhsdaq::core::{FrameSink, MultiProbeFrame, SyncedCycle};
use rhsdaq::hal::types::encode_rhs2116_payload;
use rhsdaq::hal::RawDeviceFrame;
use rhsdaq::observability::StageMetrics;
use rhsdaq::stimulus::StimulusState;
use rhsdaq::sync::{IngestOutcome, MultiDeviceSynchronizer};
use rhsdaq::SyncFault;

const A: u32 = 256;
const B: u32 = 257;
const C: u32 = 258;
const D: u32 = 259;

#[derive(Default)]
struct Collect(Mutex<Vec<MultiProbeFrame>>);

impl FrameSink for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    fn on_frame(&self, cycle: &SyncedCycle) {
        self.0.lock().unwrap().push(cycle.frame.clone());
    }
}

fn setup() -> (MultiDeviceSynchronizer, Arc<Collect>, Arc<StageMetrics>) {
    let metrics = Arc::new(StageMetrics::new("sync"));
    let mut sync = MultiDeviceSynchronizer::new(
        vec![A, B, C, D],
        250_000_000.0,
        Arc::new(StimulusState::new()),
        metrics.clone(),
    );
    let sink = Arc::new(Collect::default());
    sync.subscribe(sink.clone());
    (sync, sink, metrics)
}

/// Frame for `device` in `cycle`; the AC code encodes both
fn raw(device: u32, cycle: u64) -> RawDeviceFrame {
    let code = 32768 + (cycle as u16) * 8 + (device - A) as u16;
    RawDeviceFrame::new(device, cycle * 1000, encode_rhs2116_payload(&[code; 16], &[512; 16]))
}

#[test]
fn test_single_drop_recovers_without_reset() {
    let (mut sync, sink, metrics) = setup();
    let mut outcomes = Vec::new();

    for cycle in 0..6u64 {
        for device in [A, B, C, D] {
            if cycle == 2 && device == C {
                continue;
            }
            outcomes.push(sync.ingest(raw(device, cycle)));
        }
    }

    let frames = sink.0.lock().unwrap();
    // cycle 2 is lost, every other cycle yields exactly one frame
    assert_eq!(frames.len(), 5);
    let cycles: Vec<u64> = frames.iter().map(|f| f.clock_ticks / 1000).collect();
    assert_eq!(cycles, vec![0, 1, 3, 4, 5]);

    let resyncs: Vec<&IngestOutcome> = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Resynced(_)))
        .collect();
    assert_eq!(resyncs.len(), 1);
    assert!(matches!(
        resyncs[0],
        IngestOutcome::Resynced(SyncFault::IncompleteCycle {
            received: 3,
            expected: 4,
            resync_device: A,
            ..
        })
    ));
    assert_eq!(metrics.faults_count(), 1);
}

#[test]
fn test_consecutive_drops_converge() {
    let (mut sync, sink, _) = setup();

    // two broken cycles in a row, then clean traffic
    for device in [A, B, D] {
        sync.ingest(raw(device, 0));
    }
    for device in [A, C, D] {
        sync.ingest(raw(device, 1));
    }
    for cycle in 2..5u64 {
        for device in [A, B, C, D] {
            sync.ingest(raw(device, cycle));
        }
    }

    let frames = sink.0.lock().unwrap();
    let cycles: Vec<u64> = frames.iter().map(|f| f.clock_ticks / 1000).collect();
    assert_eq!(cycles, vec![2, 3, 4]);
    assert_eq!(frames[0].sequence_id, 0);
}

#[test]
fn test_frames_keep_device_order() {
    let (mut sync, sink, _) = setup();
    for device in [A, B, C, D] {
        sync.ingest(raw(device, 1));
    }

    let frames = sink.0.lock().unwrap();
    let ac = &frames[0].ac_uv;
    for (pos, chunk) in ac.chunks(16).enumerate() {
        let expected = (8 + pos) as f32 * 0.195;
        assert!(chunk.iter().all(|v| (v - expected).abs() < 1e-4), "device {}", pos);
    }
}

#[test]
fn test_heartbeat_frames_ignored() {
    let (mut sync, sink, _) = setup();
    for device in [A, B] {
        sync.ingest(raw(device, 0));
    }
    assert_eq!(sync.ingest(RawDeviceFrame::new(1, 0, Vec::new())), IngestOutcome::Ignored);
    for device in [C, D] {
        sync.ingest(raw(device, 0));
    }
    assert_eq!(sink.0.lock().unwrap().len(), 1);
}
