use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::descriptor::{StimulusDescriptor, DESCRIPTOR_RECORD_BYTES};
use super::step::StepSize;

/// A committed descriptor set: the unit recorded next to each frame
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusSet {
    pub step: StepSize,
    pub descriptors: Vec<StimulusDescriptor>,
}

impl StimulusSet {
    pub fn record_bytes(probe_count: usize) -> usize {
        4 + probe_count * DESCRIPTOR_RECORD_BYTES
    }

    /// Catalog record: step in nA, then one descriptor per probe
    pub fn write_record<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.step.nanoamps())?;
        for d in &self.descriptors {
            d.write_record(w)?;
        }
        Ok(())
    }

    pub fn read_record<R: Read>(r: &mut R, probe_count: usize) -> io::Result<Self> {
        let na = r.read_u32::<LittleEndian>()?;
        let step = StepSize::from_nanoamps(na).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown step size {} nA", na))
        })?;
        let descriptors = (0..probe_count)
            .map(|_| StimulusDescriptor::read_record(r))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { step, descriptors })
    }
}

/// Every distinct set committed in this process, deduplicated by value.
///
/// Ids are indices into the library and stay stable for its lifetime.
#[derive(Debug, Default)]
pub struct StimulusLibrary {
    sets: Vec<StimulusSet>,
}

impl StimulusLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of an equal set already present, or of the newly added one
    pub fn intern(&mut self, set: &StimulusSet) -> i32 {
        if let Some(id) = self.sets.iter().position(|s| s == set) {
            return id as i32;
        }
        self.sets.push(set.clone());
        (self.sets.len() - 1) as i32
    }

    pub fn get(&self, id: i32) -> Option<&StimulusSet> {
        usize::try_from(id).ok().and_then(|i| self.sets.get(i))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
