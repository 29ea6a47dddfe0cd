use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::config::{Alignment, EdgeMode, SpikeConfig};
use crate::buffers::{ProbeStatistics, RingBufferEngine};
use crate::observability::StageMetrics;

/// A detected spike with its waveform and timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    pub probe: usize,
    /// Dense-buffer sample count of the aligned extremum
    pub sample_count: u64,
    pub min_uv: f32,
    pub max_uv: f32,
    /// Offsets of the extrema inside `waveform`
    pub min_offset: usize,
    pub max_offset: usize,
    pub waveform: Vec<f32>,
    /// Hub clock ticks of the aligned extremum
    pub clock_ticks: u64,
    /// Nanoseconds since the detector was created
    pub monotonic_ns: u64,
    pub wall_clock_ns: u64,
}

/// Dense samples copied out under the buffer lock
struct Span {
    start: u64,
    from: u64,
    to: u64,
    ac: Vec<Vec<f32>>,
    clocks: Vec<u64>,
}

fn arg_min(data: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in data.iter().enumerate() {
        if *v < data[best] {
            best = i;
        }
    }
    best
}

fn arg_max(data: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in data.iter().enumerate() {
        if *v > data[best] {
            best = i;
        }
    }
    best
}

/// Streaming threshold-crossing detector over the dense buffer.
///
/// Candidate sample `T` is examined once `T + 2W` samples have been written
/// (`W` = waveform length), so both the search span `[T, T + W)` and any
/// emitted window are fully available. After a spike reported at sample `S`
/// the probe ignores crossings until `S + W`.
pub struct SpikeDetector {
    config: SpikeConfig,
    num_probes: usize,
    next_count: u64,
    suppressed_until: Vec<u64>,
    started: Instant,
    metrics: Arc<StageMetrics>,
}

impl SpikeDetector {
    pub fn new(num_probes: usize, config: SpikeConfig, metrics: Arc<StageMetrics>) -> Self {
        Self {
            config,
            num_probes,
            next_count: 0,
            suppressed_until: vec![0; num_probes],
            started: Instant::now(),
            metrics,
        }
    }

    pub fn config(&self) -> &SpikeConfig {
        &self.config
    }

    /// Next candidate sample not yet examined
    pub fn position(&self) -> u64 {
        self.next_count
    }

    pub fn reset(&mut self) {
        self.next_count = 0;
        self.suppressed_until.iter_mut().for_each(|s| *s = 0);
    }

    fn snapshot(&self, engine: &RingBufferEngine) -> Option<Span> {
        let w = self.config.waveform_length_samples as u64;
        let next = self.next_count;
        let num_probes = self.num_probes;

        engine.with_dense(|ring| {
            let count = ring.count();
            let size = ring.size() as u64;
            if count < 3 * w || size < 3 * w {
                return None;
            }

            let earliest = (count.saturating_sub(size) + w).max(w);
            let from = next.max(earliest);
            let to = count - 2 * w + 1;
            if from >= to {
                return None;
            }

            let start = from - w;
            let len = (count - start) as usize;
            let ac = (0..num_probes)
                .map(|p| ring.window(p, start, len).map(|s| s.to_vec()).unwrap_or_default())
                .collect();
            let clocks = (start..count).map(|c| ring.clock_at(c).unwrap_or(0)).collect();

            Some(Span { start, from, to, ac, clocks })
        })
    }

    /// Examine every candidate that has full context and return new spikes
    pub fn process(&mut self, engine: &RingBufferEngine) -> Vec<Spike> {
        if !self.config.enabled {
            return Vec::new();
        }
        let span = match self.snapshot(engine) {
            Some(span) => span,
            None => return Vec::new(),
        };

        if span.from > self.next_count && self.next_count > 0 {
            let skipped = span.from - self.next_count;
            warn!("Spike detector fell behind, skipped {} samples", skipped);
            self.metrics.record_dropped(skipped);
        }

        let start = self.metrics.start_processing();
        let mut spikes = Vec::new();
        for probe in 0..self.num_probes {
            let stats = engine.probe_stat(probe).unwrap_or_default();
            if stats.count < 2 || stats.deviation <= 0.0 {
                continue;
            }
            self.detect_probe(probe, &span, &stats, &mut spikes);
        }
        self.next_count = span.to;

        for spike in &spikes {
            engine.mark_spike(spike.probe, spike.sample_count);
            self.metrics.record_frame_processed();
        }
        self.metrics.finish_processing(start);

        if !spikes.is_empty() {
            debug!("Detected {} spikes up to sample {}", spikes.len(), span.to);
        }
        spikes
    }

    fn detect_probe(&mut self, probe: usize, span: &Span, stats: &ProbeStatistics, out: &mut Vec<Spike>) {
        let data = &span.ac[probe];
        if data.is_empty() {
            return;
        }
        let w = self.config.waveform_length_samples;
        let lower = stats.lower_threshold(self.config.threshold_sd) as f32;
        let upper = stats.upper_threshold(self.config.threshold_sd) as f32;

        let mut t = span.from;
        while t < span.to {
            if t < self.suppressed_until[probe] {
                t = self.suppressed_until[probe];
                continue;
            }

            let idx = (t - span.start) as usize;
            let v = data[idx];
            let falling = match self.config.edge {
                EdgeMode::Falling if v < lower => Some(true),
                EdgeMode::Rising if v > upper => Some(false),
                EdgeMode::Either | EdgeMode::Both if v < lower => Some(true),
                EdgeMode::Either | EdgeMode::Both if v > upper => Some(false),
                _ => None,
            };

            if let Some(falling) = falling {
                if let Some(spike) = self.search(probe, span, idx, falling, lower, upper) {
                    self.suppressed_until[probe] = spike.sample_count + w as u64;
                    out.push(spike);
                }
            }
            t += 1;
        }
    }

    /// Locate both extrema after a trigger at `idx` and cut the aligned window
    fn search(&self, probe: usize, span: &Span, idx: usize, falling: bool, lower: f32, upper: f32) -> Option<Spike> {
        let data = &span.ac[probe];
        let w = self.config.waveform_length_samples;
        let primary = &data[idx..idx + w];
        let complementary_start = idx + self.config.min_sample_offset;
        let complementary = &data[complementary_start..idx + w];

        let (min_idx, max_idx) = if falling {
            (idx + arg_min(primary), complementary_start + arg_max(complementary))
        } else {
            (complementary_start + arg_min(complementary), idx + arg_max(primary))
        };

        if self.config.edge == EdgeMode::Both && !(data[min_idx] < lower && data[max_idx] > upper) {
            return None;
        }

        let aligned = match self.config.alignment {
            Alignment::Min => min_idx,
            Alignment::Max => max_idx,
        };
        let window_start = aligned - self.config.pre_samples;
        let waveform = data[window_start..window_start + w].to_vec();
        let min_offset = arg_min(&waveform);
        let max_offset = arg_max(&waveform);

        Some(Spike {
            probe,
            sample_count: span.start + aligned as u64,
            min_uv: waveform[min_offset],
            max_uv: waveform[max_offset],
            min_offset,
            max_offset,
            waveform,
            clock_ticks: span.clocks[aligned],
            monotonic_ns: self.started.elapsed().as_nanos() as u64,
            wall_clock_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
        })
    }
}
