use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::descriptor::StimulusDescriptor;
use crate::error::ConfigurationError;

/// Largest step count a magnitude register holds
pub const MAX_STEPS: f64 = 255.0;

/// Stimulation DAC current step, shared by every channel of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepSize {
    Step10nA,
    Step20nA,
    Step50nA,
    Step100nA,
    Step200nA,
    Step500nA,
    Step1000nA,
    Step2000nA,
    Step5000nA,
    Step10000nA,
}

impl StepSize {
    /// Ascending ladder
    pub const ALL: [StepSize; 10] = [
        StepSize::Step10nA,
        StepSize::Step20nA,
        StepSize::Step50nA,
        StepSize::Step100nA,
        StepSize::Step200nA,
        StepSize::Step500nA,
        StepSize::Step1000nA,
        StepSize::Step2000nA,
        StepSize::Step5000nA,
        StepSize::Step10000nA,
    ];

    pub fn nanoamps(self) -> u32 {
        match self {
            StepSize::Step10nA => 10,
            StepSize::Step20nA => 20,
            StepSize::Step50nA => 50,
            StepSize::Step100nA => 100,
            StepSize::Step200nA => 200,
            StepSize::Step500nA => 500,
            StepSize::Step1000nA => 1_000,
            StepSize::Step2000nA => 2_000,
            StepSize::Step5000nA => 5_000,
            StepSize::Step10000nA => 10_000,
        }
    }

    pub fn microamps(self) -> f64 {
        self.nanoamps() as f64 / 1000.0
    }

    pub fn from_nanoamps(na: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.nanoamps() == na)
    }

    /// (sel1, sel2, sel3) for the STEPSZ register
    pub fn sel(self) -> (u8, u8, u8) {
        match self {
            StepSize::Step10nA => (64, 19, 3),
            StepSize::Step20nA => (40, 40, 1),
            StepSize::Step50nA => (64, 40, 0),
            StepSize::Step100nA => (30, 20, 0),
            StepSize::Step200nA => (25, 10, 0),
            StepSize::Step500nA => (101, 3, 0),
            StepSize::Step1000nA => (98, 1, 0),
            StepSize::Step2000nA => (94, 0, 0),
            StepSize::Step5000nA => (38, 0, 0),
            StepSize::Step10000nA => (15, 0, 0),
        }
    }

    /// (pbias, nbias) for the STIMBIAS register
    pub fn bias(self) -> (u8, u8) {
        match self {
            StepSize::Step10nA => (6, 6),
            StepSize::Step20nA | StepSize::Step50nA | StepSize::Step100nA => (7, 7),
            StepSize::Step200nA => (8, 8),
            StepSize::Step500nA => (9, 9),
            StepSize::Step1000nA => (10, 10),
            StepSize::Step2000nA => (11, 11),
            StepSize::Step5000nA => (14, 14),
            StepSize::Step10000nA => (15, 15),
        }
    }

    /// Step count for a requested amplitude, if it fits a magnitude register
    pub fn steps_for(self, microamps: f64) -> Option<u32> {
        let steps = (microamps / self.microamps()).round();
        (steps >= 0.0 && steps <= MAX_STEPS).then_some(steps as u32)
    }
}

impl Default for StepSize {
    fn default() -> Self {
        StepSize::Step10nA
    }
}

/// An amplitude that could not be represented exactly
#[derive(Debug, Clone, PartialEq)]
pub struct LossyAmplitude {
    pub probe: usize,
    pub anodic: bool,
    pub requested_ua: f64,
    pub actual_ua: f64,
}

/// Outcome of step-size selection, shown to the user before commit
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: StepSize,
    pub lossy: Vec<LossyAmplitude>,
}

impl StepReport {
    pub fn is_exact(&self) -> bool {
        self.lossy.is_empty()
    }
}

fn smallest_step(probe: usize, d: &StimulusDescriptor) -> Result<Option<StepSize>, ConfigurationError> {
    if d.requested_anodic_ua == 0.0 && d.requested_cathodic_ua == 0.0 {
        return Ok(None);
    }
    for requested in [d.requested_anodic_ua, d.requested_cathodic_ua] {
        if !requested.is_finite() || requested < 0.0 {
            return Err(ConfigurationError::AmplitudeOutOfRange {
                probe,
                requested_ua: requested,
            });
        }
    }

    StepSize::ALL
        .iter()
        .copied()
        .find(|s| s.steps_for(d.requested_anodic_ua).is_some() && s.steps_for(d.requested_cathodic_ua).is_some())
        .map(Some)
        .ok_or(ConfigurationError::AmplitudeOutOfRange {
            probe,
            requested_ua: d.requested_anodic_ua.max(d.requested_cathodic_ua),
        })
}

/// Pick one step size for a whole descriptor set and quantize every amplitude.
///
/// The step is the smallest that represents each descriptor's larger phase in
/// at most 255 steps, maximized across descriptors. Step counts and actual
/// amplitudes are written back into `descriptors`.
pub fn choose_step_size(descriptors: &mut [StimulusDescriptor]) -> Result<StepReport, ConfigurationError> {
    let mut step = StepSize::default();
    for (probe, d) in descriptors.iter().enumerate() {
        if let Some(s) = smallest_step(probe, d)? {
            step = step.max(s);
        }
    }

    let mut lossy = Vec::new();
    for (probe, d) in descriptors.iter_mut().enumerate() {
        // Both phases fit at `step` because it is at least each probe's minimum
        d.anodic_steps = step.steps_for(d.requested_anodic_ua).unwrap_or(0);
        d.cathodic_steps = step.steps_for(d.requested_cathodic_ua).unwrap_or(0);
        d.actual_anodic_ua = d.anodic_steps as f64 * step.microamps();
        d.actual_cathodic_ua = d.cathodic_steps as f64 * step.microamps();

        for (anodic, requested, actual) in [
            (true, d.requested_anodic_ua, d.actual_anodic_ua),
            (false, d.requested_cathodic_ua, d.actual_cathodic_ua),
        ] {
            if (requested - actual).abs() > 1e-9 {
                lossy.push(LossyAmplitude {
                    probe,
                    anodic,
                    requested_ua: requested,
                    actual_ua: actual,
                });
            }
        }
    }

    if lossy.is_empty() {
        info!("Stimulus step size {} nA, all amplitudes exact", step.nanoamps());
    } else {
        warn!(
            "Stimulus step size {} nA, {} amplitude(s) rounded",
            step.nanoamps(),
            lossy.len()
        );
    }

    Ok(StepReport { step, lossy })
}
