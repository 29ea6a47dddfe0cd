use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::{FrameSink, MultiProbeFrame, SyncedCycle};
use crate::error::{ConfigurationError, SyncFault};
use crate::hal::{ChannelMap, RawDeviceFrame, Rhs2116Sample, RHS2116_CHANNELS, RHS2116_PAYLOAD_BYTES};
use crate::observability::StageMetrics;
use crate::stimulus::StimulusState;

/// Result of feeding one raw frame to the synchronizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Frame stored; the cycle is not complete yet
    Pending,
    /// Cycle completed and a frame with this sequence id was emitted
    Emitted(u64),
    /// Frame from a device outside the configured order
    Ignored,
    /// Cycle was incomplete and has been discarded
    Resynced(SyncFault),
}

/// Collates round-robin device frames into logical multi-probe samples.
///
/// Frames arrive one device at a time in the configured order. A cycle is
/// complete once every device has contributed. A frame that repeats a device
/// already in the group, or that comes from a device earlier in the order
/// than the last one seen, proves the current group lost a frame: the group
/// is dropped and the cycle boundary is re-anchored on the offending frame,
/// which then opens the next cycle.
pub struct MultiDeviceSynchronizer {
    device_order: Vec<u32>,
    positions: HashMap<u32, usize>,
    channel_map: ChannelMap,
    hub_clock_hz: f64,
    group: Vec<Option<RawDeviceFrame>>,
    group_len: usize,
    last_position: Option<usize>,
    frame_counter: u64,
    cycle_boundary: u64,
    next_sequence: u64,
    first_time: Option<f64>,
    stimulus: Arc<StimulusState>,
    sinks: Vec<Arc<dyn FrameSink>>,
    metrics: Arc<StageMetrics>,
}

impl MultiDeviceSynchronizer {
    pub fn new(
        device_order: Vec<u32>,
        hub_clock_hz: f64,
        stimulus: Arc<StimulusState>,
        metrics: Arc<StageMetrics>,
    ) -> Self {
        let positions = device_order
            .iter()
            .enumerate()
            .map(|(pos, dev)| (*dev, pos))
            .collect();
        let num_probes = device_order.len() * RHS2116_CHANNELS;

        Self {
            group: vec![None; device_order.len()],
            device_order,
            positions,
            channel_map: ChannelMap::identity(num_probes),
            hub_clock_hz,
            group_len: 0,
            last_position: None,
            frame_counter: 0,
            cycle_boundary: 0,
            next_sequence: 0,
            first_time: None,
            stimulus,
            sinks: Vec::new(),
            metrics,
        }
    }

    pub fn device_order(&self) -> &[u32] {
        &self.device_order
    }

    pub fn num_devices(&self) -> usize {
        self.device_order.len()
    }

    pub fn num_probes(&self) -> usize {
        self.device_order.len() * RHS2116_CHANNELS
    }

    /// Size of one concatenated raw cycle
    pub fn cycle_payload_bytes(&self) -> usize {
        self.device_order.len() * RHS2116_PAYLOAD_BYTES
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Replace the probe-to-electrode permutation as a whole
    pub fn set_channel_map(&mut self, permutation: Vec<usize>) -> Result<(), ConfigurationError> {
        self.channel_map.set(permutation)
    }

    pub fn subscribe(&mut self, sink: Arc<dyn FrameSink>) {
        debug!("Frame sink '{}' subscribed", sink.name());
        self.sinks.push(sink);
    }

    pub fn unsubscribe(&mut self, name: &str) {
        self.sinks.retain(|s| s.name() != name);
    }

    /// Raw frames seen so far, including discarded ones
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Frame index at which the current cycle started
    pub fn cycle_boundary(&self) -> u64 {
        self.cycle_boundary
    }

    /// Forget partial cycles and the time origin (e.g. on playback restart)
    pub fn reset(&mut self) {
        self.clear_group();
        self.first_time = None;
        self.next_sequence = 0;
        self.cycle_boundary = self.frame_counter;
    }

    pub fn ingest(&mut self, raw: RawDeviceFrame) -> IngestOutcome {
        let position = match self.positions.get(&raw.device_index) {
            Some(pos) => *pos,
            None => return IngestOutcome::Ignored,
        };

        self.frame_counter += 1;

        if raw.payload.len() < RHS2116_PAYLOAD_BYTES {
            let fault = SyncFault::PayloadSize {
                device: raw.device_index,
                got: raw.payload.len(),
                expected: RHS2116_PAYLOAD_BYTES,
            };
            warn!("Synchronization fault: {}", fault);
            self.metrics.record_fault();
            self.clear_group();
            self.cycle_boundary = self.frame_counter;
            return IngestOutcome::Resynced(fault);
        }

        let broken = self.group[position].is_some()
            || self.last_position.map_or(false, |last| position <= last);

        let fault = if broken {
            let fault = SyncFault::IncompleteCycle {
                cycle: self.next_sequence,
                received: self.group_len,
                expected: self.device_order.len(),
                resync_device: raw.device_index,
            };
            warn!("Synchronization fault: {}", fault);
            self.metrics.record_fault();
            self.metrics.record_dropped(self.group_len as u64);
            self.clear_group();
            // The offending frame opens the next cycle
            self.cycle_boundary = self.frame_counter - 1;
            Some(fault)
        } else {
            None
        };

        self.group[position] = Some(raw);
        self.group_len += 1;
        self.last_position = Some(position);

        if self.group_len == self.device_order.len() {
            let seq = self.emit();
            self.cycle_boundary = self.frame_counter;
            return match fault {
                Some(f) => IngestOutcome::Resynced(f),
                None => IngestOutcome::Emitted(seq),
            };
        }

        match fault {
            Some(f) => IngestOutcome::Resynced(f),
            None => IngestOutcome::Pending,
        }
    }

    fn clear_group(&mut self) {
        for slot in self.group.iter_mut() {
            *slot = None;
        }
        self.group_len = 0;
        self.last_position = None;
    }

    fn emit(&mut self) -> u64 {
        let start = self.metrics.start_processing();
        let num_probes = self.num_probes();
        let mut hw_ac = vec![0.0f32; num_probes];
        let mut hw_dc = vec![0.0f32; num_probes];
        let mut raw_payload = Vec::with_capacity(self.cycle_payload_bytes());
        let mut clock_ticks = 0;

        for (pos, slot) in self.group.iter_mut().enumerate() {
            if let Some(raw) = slot.take() {
                if pos == 0 {
                    clock_ticks = raw.clock_ticks;
                }
                if let Some(sample) = Rhs2116Sample::decode(&raw.payload) {
                    let base = pos * RHS2116_CHANNELS;
                    hw_ac[base..base + RHS2116_CHANNELS].copy_from_slice(&sample.ac_uv);
                    hw_dc[base..base + RHS2116_CHANNELS].copy_from_slice(&sample.dc_mv);
                }
                raw_payload.extend_from_slice(&raw.payload[..RHS2116_PAYLOAD_BYTES]);
            }
        }
        self.group_len = 0;
        self.last_position = None;

        let seq = self.next_sequence;
        self.next_sequence += 1;

        let mut frame = MultiProbeFrame::new(seq, num_probes);
        self.channel_map.apply(&hw_ac, &mut frame.ac_uv);
        self.channel_map.apply(&hw_dc, &mut frame.dc_mv);

        frame.clock_ticks = clock_ticks;
        frame.acquisition_time = clock_ticks as f64 / self.hub_clock_hz;
        let first = *self.first_time.get_or_insert(frame.acquisition_time);
        frame.delta_time = frame.acquisition_time - first;

        let (active, id) = self.stimulus.next_sample();
        frame.stimulus_active = active;
        frame.stimulus_id = id;

        let wall_clock_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let cycle = SyncedCycle {
            frame,
            raw_payload,
            wall_clock_ns,
        };

        for sink in &self.sinks {
            sink.on_frame(&cycle);
        }

        self.metrics.record_frame_processed();
        self.metrics.finish_processing(start);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::types::encode_rhs2116_payload;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<MultiProbeFrame>>);

    impl FrameSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn on_frame(&self, cycle: &SyncedCycle) {
            self.0.lock().unwrap().push(cycle.frame.clone());
        }
    }

    fn payload(code: u16) -> Vec<u8> {
        encode_rhs2116_payload(&[code; 16], &[512; 16])
    }

    fn sync(devices: Vec<u32>) -> (MultiDeviceSynchronizer, Arc<Collect>) {
        let mut sync = MultiDeviceSynchronizer::new(
            devices,
            250_000_000.0,
            Arc::new(StimulusState::new()),
            Arc::new(StageMetrics::new("sync")),
        );
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        sync.subscribe(sink.clone());
        (sync, sink)
    }

    #[test]
    fn test_emits_once_per_complete_cycle() {
        let (mut sync, sink) = sync(vec![10, 11]);

        assert_eq!(sync.ingest(RawDeviceFrame::new(10, 0, payload(32768))), IngestOutcome::Pending);
        assert_eq!(sync.ingest(RawDeviceFrame::new(11, 0, payload(32768))), IngestOutcome::Emitted(0));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(sync.frame_counter(), 2);
        assert_eq!(sync.cycle_boundary(), 2);
    }

    #[test]
    fn test_unknown_device_ignored() {
        let (mut sync, sink) = sync(vec![10]);
        assert_eq!(sync.ingest(RawDeviceFrame::new(1, 0, vec![])), IngestOutcome::Ignored);
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(sync.frame_counter(), 0);
    }

    #[test]
    fn test_probe_order_follows_device_order() {
        let (mut sync, sink) = sync(vec![11, 10]);
        sync.ingest(RawDeviceFrame::new(11, 0, payload(32768 + 10)));
        sync.ingest(RawDeviceFrame::new(10, 0, payload(32768 + 20)));

        let frames = sink.0.lock().unwrap();
        assert!((frames[0].ac_uv[0] - 1.95).abs() < 1e-4);
        assert!((frames[0].ac_uv[16] - 3.9).abs() < 1e-4);
    }

    #[test]
    fn test_channel_map_applied() {
        let (mut sync, sink) = sync(vec![10]);
        let mut perm: Vec<usize> = (0..16).collect();
        perm.swap(0, 5);
        sync.set_channel_map(perm).unwrap();

        let mut ac = [32768u16; 16];
        ac[0] = 32768 + 100;
        sync.ingest(RawDeviceFrame::new(10, 0, encode_rhs2116_payload(&ac, &[512; 16])));

        let frames = sink.0.lock().unwrap();
        assert!((frames[0].ac_uv[5] - 19.5).abs() < 1e-4);
        assert_eq!(frames[0].ac_uv[0], 0.0);
    }

    #[test]
    fn test_delta_time_from_first_sample() {
        let (mut sync, sink) = sync(vec![10]);
        sync.ingest(RawDeviceFrame::new(10, 250_000_000, payload(32768)));
        sync.ingest(RawDeviceFrame::new(10, 500_000_000, payload(32768)));

        let frames = sink.0.lock().unwrap();
        assert_eq!(frames[0].acquisition_time, 1.0);
        assert_eq!(frames[0].delta_time, 0.0);
        assert_eq!(frames[1].delta_time, 1.0);
    }

    #[test]
    fn test_short_payload_discards_group() {
        let (mut sync, sink) = sync(vec![10, 11]);
        sync.ingest(RawDeviceFrame::new(10, 0, payload(32768)));
        let outcome = sync.ingest(RawDeviceFrame::new(11, 0, vec![0; 4]));
        assert!(matches!(outcome, IngestOutcome::Resynced(SyncFault::PayloadSize { .. })));

        sync.ingest(RawDeviceFrame::new(10, 1, payload(32768)));
        sync.ingest(RawDeviceFrame::new(11, 1, payload(32768)));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stimulus_state_stamped() {
        let stimulus = Arc::new(StimulusState::new());
        let mut sync = MultiDeviceSynchronizer::new(
            vec![10],
            250_000_000.0,
            stimulus.clone(),
            Arc::new(StageMetrics::new("sync")),
        );
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        sync.subscribe(sink.clone());

        stimulus.set(true, 3);
        sync.ingest(RawDeviceFrame::new(10, 0, payload(32768)));

        let frames = sink.0.lock().unwrap();
        assert!(frames[0].stimulus_active);
        assert_eq!(frames[0].stimulus_id, 3);
    }

    #[test]
    fn test_timed_stimulus_ends_after_its_samples() {
        let stimulus = Arc::new(StimulusState::new());
        let mut sync = MultiDeviceSynchronizer::new(
            vec![10, 11],
            250_000_000.0,
            stimulus.clone(),
            Arc::new(StageMetrics::new("sync")),
        );
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        sync.subscribe(sink.clone());

        stimulus.activate_for(5, 2);
        for t in 0..4 {
            sync.ingest(RawDeviceFrame::new(10, t, payload(32768)));
            sync.ingest(RawDeviceFrame::new(11, t, payload(32768)));
        }

        // counted per synchronized sample, not per device frame
        let frames = sink.0.lock().unwrap();
        let stamped: Vec<(bool, i32)> = frames.iter().map(|f| (f.stimulus_active, f.stimulus_id)).collect();
        assert_eq!(stamped, vec![(true, 5), (true, 5), (false, -1), (false, -1)]);
    }
}
