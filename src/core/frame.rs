use serde::{Deserialize, Serialize};

/// One synchronized sample across all devices, in logical electrode order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiProbeFrame {
    /// Sequential cycle number for ordering
    pub sequence_id: u64,

    /// Acquisition-clock ticks of the first device in the cycle
    pub clock_ticks: u64,

    /// Acquisition time in seconds on the hub clock
    pub acquisition_time: f64,

    /// Seconds since the first synchronized sample
    pub delta_time: f64,

    pub ac_uv: Vec<f32>,
    pub dc_mv: Vec<f32>,

    pub stimulus_active: bool,

    /// Catalog index of the active stimulus set, -1 when inactive
    pub stimulus_id: i32,

    pub spikes: Vec<bool>,
}

impl MultiProbeFrame {
    pub fn new(sequence_id: u64, num_probes: usize) -> Self {
        Self {
            sequence_id,
            clock_ticks: 0,
            acquisition_time: 0.0,
            delta_time: 0.0,
            ac_uv: vec![0.0; num_probes],
            dc_mv: vec![0.0; num_probes],
            stimulus_active: false,
            stimulus_id: -1,
            spikes: vec![false; num_probes],
        }
    }

    pub fn num_probes(&self) -> usize {
        self.ac_uv.len()
    }
}

/// A synchronized frame together with the raw bytes it was built from
#[derive(Debug, Clone)]
pub struct SyncedCycle {
    pub frame: MultiProbeFrame,

    /// Device payloads concatenated in configured device order
    pub raw_payload: Vec<u8>,

    /// Wall-clock time of emission, nanoseconds since the UNIX epoch
    pub wall_clock_ns: u64,
}
