use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::spikes::SpikeConfig;
use crate::stimulus::CommitMode;

/// Acquisition configuration file format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaqConfig {
    pub version: String,

    /// Per-device sample rate of the amplifier chips
    pub sample_rate_hz: f64,

    /// Acquisition (hub) clock used to time-stamp raw frames
    pub hub_clock_hz: f64,

    pub buffers: BufferConfig,
    pub spikes: SpikeConfig,
    pub recording: RecordingConfig,
    pub stimulus: StimulusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Dense buffer length in samples
    pub dense_samples: usize,
    /// Sparse buffer length in (decimated) samples
    pub sparse_samples: usize,
    /// Keep every Kth sample in the sparse buffer
    pub sparse_decimation: usize,
    /// Statistics recompute period
    pub stats_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingConfig {
    pub root_dir: PathBuf,
    pub loop_playback: bool,
    /// Nominal heartbeat frequency; playback derives its drift ticks from
    /// the frame count at this rate
    pub heartbeat_hz: f64,
    /// Frames buffered between the ingestion path and the writer thread
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StimulusConfig {
    pub commit_mode: CommitMode,
    /// Hold the stimulus trigger off while the table is rewritten
    pub atomic_commit: bool,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            sample_rate_hz: 30_000.0,
            hub_clock_hz: 250_000_000.0,
            buffers: BufferConfig::default(),
            spikes: SpikeConfig::default(),
            recording: RecordingConfig::default(),
            stimulus: StimulusConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            dense_samples: 30_000,
            sparse_samples: 10_000,
            sparse_decimation: 30,
            stats_interval_ms: 1000,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("recordings"),
            loop_playback: false,
            heartbeat_hz: 100.0,
            queue_capacity: 1 << 16,
        }
    }
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            commit_mode: CommitMode::Verified,
            atomic_commit: true,
        }
    }
}

impl DaqConfig {
    /// Load configuration, writing defaults first if the file is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {:?}", path))?;
        let config: DaqConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).context(format!("Failed to write config to {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz <= 0.0 || self.hub_clock_hz <= 0.0 {
            anyhow::bail!("Sample rate and hub clock must be positive");
        }
        if self.buffers.dense_samples == 0 || self.buffers.sparse_samples == 0 {
            anyhow::bail!("Buffer sizes must be nonzero");
        }
        if self.buffers.sparse_decimation == 0 {
            anyhow::bail!("Sparse decimation must be at least 1");
        }
        self.spikes.validate()?;
        // Each candidate needs one waveform of history and two of lookahead
        if self.spikes.waveform_length_samples * 3 > self.buffers.dense_samples {
            anyhow::bail!(
                "Dense buffer ({} samples) too short for {}-sample waveforms",
                self.buffers.dense_samples,
                self.spikes.waveform_length_samples
            );
        }
        if self.recording.heartbeat_hz <= 0.0 {
            anyhow::bail!("Heartbeat frequency must be positive");
        }
        Ok(())
    }
}
