use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::HardwareFault;
use crate::hal::registers::{fmc, heartbeat, rhs2116};
use crate::hal::traits::OniContext;
use crate::hal::types::{
    ac_code_for_uv, encode_rhs2116_payload, type_id, DeviceEntry, RawDeviceFrame,
    RHS2116_CHANNELS, RHS2116_PAYLOAD_BYTES,
};

/// Base clock reported by the simulated heartbeat
pub const SIMULATED_CLOCK_HZ: u32 = 250_000_000;

struct GeneratorState {
    sample_rate_hz: f64,
    realtime: bool,
    spike_interval_samples: u64,
    cycle: u64,
    next_device: usize,
    started: Option<Instant>,
    noise: u32,
}

/// In-memory ONI context: a register file plus a frame source.
///
/// Frames come from an explicit queue first; when the queue is empty and the
/// generator is enabled, synthetic round-robin RHS2116 frames are produced.
pub struct SimulatedOni {
    table: Vec<DeviceEntry>,
    registers: Mutex<HashMap<(u32, u32), u32>>,
    writes: Mutex<Vec<(u32, u32, u32)>>,
    corrupt: Mutex<HashSet<(u32, u32)>>,
    failing_writes: Mutex<HashSet<(u32, u32)>>,
    queue: Mutex<VecDeque<RawDeviceFrame>>,
    generator: Mutex<Option<GeneratorState>>,
    generating: AtomicBool,
}

impl SimulatedOni {
    pub fn new(table: Vec<DeviceEntry>) -> Self {
        let mut registers = HashMap::new();
        for entry in &table {
            match entry.type_id {
                type_id::RHS2116 => {
                    registers.insert((entry.device_index, rhs2116::MAXDELTAS), 1024);
                    registers.insert((entry.device_index, rhs2116::SEQERROR), 0);
                }
                type_id::HEARTBEAT => {
                    registers.insert((entry.device_index, heartbeat::CLK_HZ), SIMULATED_CLOCK_HZ);
                }
                type_id::FMC => {
                    registers.insert((entry.device_index, fmc::LINK_STATE), 1);
                }
                _ => {}
            }
        }

        Self {
            table,
            registers: Mutex::new(registers),
            writes: Mutex::new(Vec::new()),
            corrupt: Mutex::new(HashSet::new()),
            failing_writes: Mutex::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            generator: Mutex::new(None),
            generating: AtomicBool::new(false),
        }
    }

    /// Standard headstage: FMC link, heartbeat and `chips` RHS2116 devices
    pub fn with_headstage(chips: u32) -> Self {
        let mut table = vec![
            DeviceEntry { device_index: 0, type_id: type_id::FMC, firmware_version: 1, read_size: 0, write_size: 4 },
            DeviceEntry { device_index: 1, type_id: type_id::HEARTBEAT, firmware_version: 1, read_size: 0, write_size: 0 },
        ];
        for chip in 0..chips {
            table.push(DeviceEntry {
                device_index: 256 + chip,
                type_id: type_id::RHS2116,
                firmware_version: 2,
                read_size: RHS2116_PAYLOAD_BYTES,
                write_size: 0,
            });
        }
        Self::new(table)
    }

    /// Enable the synthetic frame generator
    pub fn start_generator(&self, sample_rate_hz: f64, realtime: bool) {
        let spike_interval_samples = (sample_rate_hz / 4.0).max(1.0) as u64;
        *self.generator.lock().unwrap_or_else(|p| p.into_inner()) = Some(GeneratorState {
            sample_rate_hz,
            realtime,
            spike_interval_samples,
            cycle: 0,
            next_device: 0,
            started: None,
            noise: 0x1234_5678,
        });
        self.generating.store(true, Ordering::Release);
    }

    pub fn stop_generator(&self) {
        self.generating.store(false, Ordering::Release);
    }

    pub fn push_frame(&self, frame: RawDeviceFrame) {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).push_back(frame);
    }

    pub fn pending_frames(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Set a register without it counting as a host write
    pub fn set_register(&self, device: u32, address: u32, value: u32) {
        self.registers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((device, address), value);
    }

    pub fn register(&self, device: u32, address: u32) -> Option<u32> {
        self.registers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(device, address))
            .copied()
    }

    /// Make reads of this register return a flipped bit
    pub fn corrupt_readback(&self, device: u32, address: u32) {
        self.corrupt.lock().unwrap_or_else(|p| p.into_inner()).insert((device, address));
    }

    /// Make writes to this register fail outright
    pub fn fail_writes_to(&self, device: u32, address: u32) {
        self.failing_writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((device, address));
    }

    pub fn clear_faults(&self) {
        self.corrupt.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.failing_writes.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Every host write so far, in order
    pub fn writes(&self) -> Vec<(u32, u32, u32)> {
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn rhs_devices(&self) -> Vec<u32> {
        self.table
            .iter()
            .filter(|e| e.type_id == type_id::RHS2116)
            .map(|e| e.device_index)
            .collect()
    }

    fn generate(&self) -> Option<RawDeviceFrame> {
        let devices = self.rhs_devices();
        if devices.is_empty() {
            return None;
        }

        let mut guard = self.generator.lock().unwrap_or_else(|p| p.into_inner());
        let state = guard.as_mut()?;

        if state.realtime {
            let started = *state.started.get_or_insert_with(Instant::now);
            let due = Duration::from_secs_f64(state.cycle as f64 / state.sample_rate_hz);
            let elapsed = started.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }

        let device = devices[state.next_device];
        let t = state.cycle as f64 / state.sample_rate_hz;
        let ticks = (t * SIMULATED_CLOCK_HZ as f64) as u64;

        let mut ac = [0u16; RHS2116_CHANNELS];
        let mut dc = [0u16; RHS2116_CHANNELS];
        let phase_in_spike = state.cycle % state.spike_interval_samples;

        for ch in 0..RHS2116_CHANNELS {
            // xorshift noise, roughly ±10 µV
            state.noise ^= state.noise << 13;
            state.noise ^= state.noise >> 17;
            state.noise ^= state.noise << 5;
            let noise = ((state.noise % 2000) as f64 / 100.0) - 10.0;

            let freq = 8.0 + ch as f64;
            let mut uv = 15.0 * (2.0 * std::f64::consts::PI * freq * t).sin() + noise;

            if ch == 0 && phase_in_spike < 20 {
                // biphasic extracellular spike shape
                let x = phase_in_spike as f64;
                uv += -250.0 * (-(x - 5.0).powi(2) / 6.0).exp() + 90.0 * (-(x - 12.0).powi(2) / 10.0).exp();
            }

            ac[ch] = ac_code_for_uv(uv as f32);
            dc[ch] = 512 + ch as u16;
        }

        state.next_device += 1;
        if state.next_device == devices.len() {
            state.next_device = 0;
            state.cycle += 1;
        }

        Some(RawDeviceFrame::new(device, ticks, encode_rhs2116_payload(&ac, &dc)))
    }
}

impl OniContext for SimulatedOni {
    fn read_register(&self, device: u32, address: u32) -> Result<u32, HardwareFault> {
        let value = self
            .registers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(device, address))
            .copied()
            .unwrap_or(0);

        if self.corrupt.lock().unwrap_or_else(|p| p.into_inner()).contains(&(device, address)) {
            return Ok(value ^ 1);
        }
        Ok(value)
    }

    fn write_register(&self, device: u32, address: u32, value: u32) -> Result<(), HardwareFault> {
        if self
            .failing_writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&(device, address))
        {
            return Err(HardwareFault::WriteFailed { device, address });
        }

        self.writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((device, address, value));
        self.registers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((device, address), value);
        Ok(())
    }

    fn read_frame(&self, timeout: Duration) -> Result<Option<RawDeviceFrame>, HardwareFault> {
        if let Some(frame) = self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front() {
            return Ok(Some(frame));
        }

        if self.generating.load(Ordering::Acquire) {
            return Ok(self.generate());
        }

        thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(None)
    }

    fn device_table(&self) -> Vec<DeviceEntry> {
        self.table.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_file_roundtrip() {
        let oni = SimulatedOni::with_headstage(1);
        oni.write_register(256, rhs2116::NUMDELTAS, 12).unwrap();
        assert_eq!(oni.read_register(256, rhs2116::NUMDELTAS).unwrap(), 12);
        assert_eq!(oni.write_count(), 1);
    }

    #[test]
    fn test_corrupt_readback() {
        let oni = SimulatedOni::with_headstage(1);
        oni.corrupt_readback(256, rhs2116::STEPSZ);
        oni.write_register(256, rhs2116::STEPSZ, 0x10).unwrap();
        assert_eq!(oni.read_register(256, rhs2116::STEPSZ).unwrap(), 0x11);
    }

    #[test]
    fn test_generator_round_robin() {
        let oni = SimulatedOni::with_headstage(2);
        oni.start_generator(30_000.0, false);

        let ids: Vec<u32> = (0..4)
            .map(|_| oni.read_frame(Duration::from_millis(1)).unwrap().unwrap().device_index)
            .collect();
        assert_eq!(ids, vec![256, 257, 256, 257]);
    }

    #[test]
    fn test_queue_takes_priority() {
        let oni = SimulatedOni::with_headstage(1);
        oni.push_frame(RawDeviceFrame::new(256, 7, vec![0; RHS2116_PAYLOAD_BYTES]));
        let frame = oni.read_frame(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(frame.clock_ticks, 7);
        assert!(oni.read_frame(Duration::from_millis(1)).unwrap().is_none());
    }
}
