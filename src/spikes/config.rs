use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Which threshold crossings start a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// Above `mean + k * sd`
    Rising,
    /// Below `mean - k * sd`
    #[default]
    Falling,
    /// Either crossing
    Either,
    /// Either crossing, and the waveform must cross both thresholds
    Both,
}

/// Which extremum the emitted window is aligned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    #[default]
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    pub enabled: bool,
    /// Threshold multiplier `k` on the probe standard deviation
    pub threshold_sd: f64,
    pub edge: EdgeMode,
    pub alignment: Alignment,
    /// Emitted window length, also the search span and refractory period
    pub waveform_length_samples: usize,
    /// Samples kept before the aligned extremum
    pub pre_samples: usize,
    /// Samples skipped after the trigger before looking for the complementary extremum
    pub min_sample_offset: usize,
    pub history_capacity: usize,
    /// Moving-average length of the burst-rate accumulator, in 1 s windows
    pub burst_windows: usize,
    pub diagnostics_capacity: usize,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_sd: 5.0,
            edge: EdgeMode::Falling,
            alignment: Alignment::Min,
            waveform_length_samples: 60,
            pre_samples: 20,
            min_sample_offset: 3,
            history_capacity: 1024,
            burst_windows: 10,
            diagnostics_capacity: 10_000,
        }
    }
}

impl SpikeConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.waveform_length_samples == 0 {
            return Err(ConfigurationError::Buffer("waveform length must be nonzero".to_string()));
        }
        if self.pre_samples >= self.waveform_length_samples {
            return Err(ConfigurationError::Buffer(format!(
                "pre-extremum samples ({}) must be shorter than the waveform ({})",
                self.pre_samples, self.waveform_length_samples
            )));
        }
        if self.min_sample_offset >= self.waveform_length_samples {
            return Err(ConfigurationError::Buffer(
                "minimum sample offset must fall inside the waveform".to_string(),
            ));
        }
        if self.threshold_sd <= 0.0 {
            return Err(ConfigurationError::Buffer("threshold multiplier must be positive".to_string()));
        }
        Ok(())
    }
}
