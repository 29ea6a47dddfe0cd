use std::collections::BTreeMap;

use super::descriptor::StimulusDescriptor;
use super::step::StepSize;
use crate::error::ConfigurationError;
use crate::hal::registers::rhs2116::{self, MAX_DELTA_KEYS, MAX_DELTA_TIME};
use crate::hal::{ChannelMap, RHS2116_CHANNELS};

/// Time-keyed event table for one device, ascending by time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaTable {
    entries: BTreeMap<u32, u32>,
}

impl DeltaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `bits` into the value at `time`, creating the key if absent
    pub fn insert(&mut self, time: u32, bits: u32) {
        *self.entries.entry(time).or_insert(0) |= bits;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, time: u32) -> Option<u32> {
        self.entries.get(&time).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries.iter().map(|(t, v)| (*t, *v))
    }

    pub fn last_time(&self) -> Option<u32> {
        self.entries.keys().next_back().copied()
    }
}

/// Everything written to one chip for a stimulus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProgram {
    pub device_index: u32,
    /// Cathodic step counts by hardware channel
    pub negative_steps: [u8; RHS2116_CHANNELS],
    /// Anodic step counts by hardware channel
    pub positive_steps: [u8; RHS2116_CHANNELS],
    pub table: DeltaTable,
}

impl DeviceProgram {
    pub fn empty(device_index: u32) -> Self {
        Self {
            device_index,
            negative_steps: [0; RHS2116_CHANNELS],
            positive_steps: [0; RHS2116_CHANNELS],
            table: DeltaTable::new(),
        }
    }
}

/// A compiled stimulus ready to be committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulusProgram {
    pub step: StepSize,
    pub devices: Vec<DeviceProgram>,
}

impl StimulusProgram {
    /// No-op stimulus for the given chips
    pub fn empty(device_order: &[u32]) -> Self {
        Self {
            step: StepSize::default(),
            devices: device_order.iter().map(|d| DeviceProgram::empty(*d)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.iter().all(|d| d.table.is_empty())
    }

    pub fn device(&self, device_index: u32) -> Option<&DeviceProgram> {
        self.devices.iter().find(|d| d.device_index == device_index)
    }

    /// Samples from trigger until the last table event on any chip
    pub fn duration_samples(&self) -> u64 {
        self.devices
            .iter()
            .filter_map(|d| d.table.last_time())
            .max()
            .unwrap_or(0) as u64
    }
}

fn delta_time(probe: usize, t: u64) -> Result<u32, ConfigurationError> {
    if t > MAX_DELTA_TIME as u64 {
        return Err(ConfigurationError::InvalidDescriptor {
            probe,
            reason: format!("event at sample {} exceeds the sequencer time range", t),
        });
    }
    Ok(t as u32)
}

/// Add one channel's events for every repetition of `d` to `table`
fn add_channel_events(
    table: &mut DeltaTable,
    probe: usize,
    channel: usize,
    d: &StimulusDescriptor,
) -> Result<(), ConfigurationError> {
    let e0 = rhs2116::pol_en_bits(channel, true, d.anodic_first);
    let e1 = rhs2116::pol_en_bits(channel, true, !d.anodic_first);

    let d0 = d.first_width() as u64;
    let d1 = d0 + d.dwell_samples as u64;
    let d2 = d1 + d.second_width() as u64;
    let cycle = d.cycle_samples();

    let mut t0 = d.delay_samples as u64;
    for _ in 0..d.number_of_stimuli {
        table.insert(delta_time(probe, t0)?, e0);
        table.insert(delta_time(probe, t0 + d0)?, 0);
        if d.biphasic {
            table.insert(delta_time(probe, t0 + d1)?, e1);
            table.insert(delta_time(probe, t0 + d2)?, 0);
        }
        t0 += cycle;
    }
    Ok(())
}

/// Compile per-electrode descriptors into per-device programs.
///
/// `descriptors[e]` applies to logical electrode `e`; it lands on hardware
/// probe `p = map.probe_for(e)`, i.e. chip `device_order[p / 16]`, channel
/// `p % 16`. Step counts must already be set by step selection. A device
/// whose table needs more than 255 time keys fails the whole compilation.
pub fn build_delta_table(
    descriptors: &[StimulusDescriptor],
    step: StepSize,
    map: &ChannelMap,
    device_order: &[u32],
) -> Result<StimulusProgram, ConfigurationError> {
    let expected = device_order.len() * RHS2116_CHANNELS;
    if descriptors.len() != expected {
        return Err(ConfigurationError::DescriptorCount {
            expected,
            got: descriptors.len(),
        });
    }
    if map.len() != expected {
        return Err(ConfigurationError::ChannelMapSize {
            expected,
            got: map.len(),
        });
    }

    let mut program = StimulusProgram::empty(device_order);
    program.step = step;

    for (electrode, d) in descriptors.iter().enumerate() {
        d.validate(electrode)?;
        if d.is_empty() {
            continue;
        }

        let probe = map.probe_for(electrode);
        let device = &mut program.devices[probe / RHS2116_CHANNELS];
        let channel = probe % RHS2116_CHANNELS;

        device.negative_steps[channel] = d.cathodic_steps.min(255) as u8;
        device.positive_steps[channel] = d.anodic_steps.min(255) as u8;
        add_channel_events(&mut device.table, electrode, channel, d)?;
    }

    for device in &program.devices {
        if device.table.len() > MAX_DELTA_KEYS {
            return Err(ConfigurationError::DeltaTableOverflow {
                device: device.device_index,
                keys: device.table.len(),
                limit: MAX_DELTA_KEYS,
            });
        }
    }

    Ok(program)
}
