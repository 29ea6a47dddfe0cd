use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::error::ConfigurationError;

/// Size of one descriptor inside a catalog record
pub const DESCRIPTOR_RECORD_BYTES: usize = 4 * 8 + 8 * 4 + 2;

/// Stimulation parameters for one logical electrode.
///
/// Timings are in samples. Step counts and actual amplitudes are filled in by
/// [`choose_step_size`](super::choose_step_size); requested amplitudes are
/// what the user asked for.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusDescriptor {
    pub requested_anodic_ua: f64,
    pub requested_cathodic_ua: f64,
    pub actual_anodic_ua: f64,
    pub actual_cathodic_ua: f64,

    pub anodic_steps: u32,
    pub cathodic_steps: u32,
    pub anodic_width_samples: u32,
    pub cathodic_width_samples: u32,
    pub dwell_samples: u32,
    pub delay_samples: u32,
    pub inter_stimulus_interval_samples: u32,
    pub number_of_stimuli: u32,

    pub biphasic: bool,
    pub anodic_first: bool,
}

impl StimulusDescriptor {
    /// Symmetric-width biphasic pulse train, cathodic phase first
    pub fn biphasic(anodic_ua: f64, cathodic_ua: f64, width_samples: u32, count: u32, isi_samples: u32) -> Self {
        Self {
            requested_anodic_ua: anodic_ua,
            requested_cathodic_ua: cathodic_ua,
            anodic_width_samples: width_samples,
            cathodic_width_samples: width_samples,
            number_of_stimuli: count,
            inter_stimulus_interval_samples: isi_samples,
            biphasic: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.number_of_stimuli == 0
    }

    /// Width of the phase that fires first
    pub fn first_width(&self) -> u32 {
        if self.anodic_first {
            self.anodic_width_samples
        } else {
            self.cathodic_width_samples
        }
    }

    pub fn second_width(&self) -> u32 {
        if self.anodic_first {
            self.cathodic_width_samples
        } else {
            self.anodic_width_samples
        }
    }

    /// Samples from one pulse onset to the next
    pub fn cycle_samples(&self) -> u64 {
        let pulse = if self.biphasic {
            self.first_width() as u64 + self.dwell_samples as u64 + self.second_width() as u64
        } else {
            self.first_width() as u64
        };
        pulse + self.inter_stimulus_interval_samples as u64
    }

    /// Validity predicate, checked on quantized step counts
    pub fn validate(&self, probe: usize) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidDescriptor {
            probe,
            reason: reason.to_string(),
        };

        if self.number_of_stimuli == 0 {
            let all_zero = self.anodic_width_samples == 0
                && self.cathodic_width_samples == 0
                && self.dwell_samples == 0
                && self.inter_stimulus_interval_samples == 0
                && self.anodic_steps == 0
                && self.cathodic_steps == 0;
            if !all_zero {
                return Err(invalid("zero repetitions with nonzero timing or amplitude"));
            }
            return Ok(());
        }

        if self.anodic_steps > 0 && self.anodic_width_samples == 0 {
            return Err(invalid("anodic amplitude set with zero width"));
        }
        if self.cathodic_steps > 0 && self.cathodic_width_samples == 0 {
            return Err(invalid("cathodic amplitude set with zero width"));
        }
        if self.number_of_stimuli > 1 && self.inter_stimulus_interval_samples == 0 {
            return Err(invalid("repeated stimulus needs a nonzero inter-stimulus interval"));
        }
        if self.first_width() == 0 {
            return Err(invalid("first phase has zero width"));
        }
        Ok(())
    }

    pub fn write_record<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f64::<LittleEndian>(self.requested_anodic_ua)?;
        w.write_f64::<LittleEndian>(self.requested_cathodic_ua)?;
        w.write_f64::<LittleEndian>(self.actual_anodic_ua)?;
        w.write_f64::<LittleEndian>(self.actual_cathodic_ua)?;
        for v in [
            self.anodic_steps,
            self.cathodic_steps,
            self.anodic_width_samples,
            self.cathodic_width_samples,
            self.dwell_samples,
            self.delay_samples,
            self.inter_stimulus_interval_samples,
            self.number_of_stimuli,
        ] {
            w.write_u32::<LittleEndian>(v)?;
        }
        w.write_u8(self.biphasic as u8)?;
        w.write_u8(self.anodic_first as u8)?;
        Ok(())
    }

    pub fn read_record<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            requested_anodic_ua: r.read_f64::<LittleEndian>()?,
            requested_cathodic_ua: r.read_f64::<LittleEndian>()?,
            actual_anodic_ua: r.read_f64::<LittleEndian>()?,
            actual_cathodic_ua: r.read_f64::<LittleEndian>()?,
            anodic_steps: r.read_u32::<LittleEndian>()?,
            cathodic_steps: r.read_u32::<LittleEndian>()?,
            anodic_width_samples: r.read_u32::<LittleEndian>()?,
            cathodic_width_samples: r.read_u32::<LittleEndian>()?,
            dwell_samples: r.read_u32::<LittleEndian>()?,
            delay_samples: r.read_u32::<LittleEndian>()?,
            inter_stimulus_interval_samples: r.read_u32::<LittleEndian>()?,
            number_of_stimuli: r.read_u32::<LittleEndian>()?,
            biphasic: r.read_u8()? != 0,
            anodic_first: r.read_u8()? != 0,
        })
    }
}
