use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::config::SpikeConfig;
use super::detector::Spike;

/// Spike counts in consecutive fixed-length windows with a moving average
#[derive(Debug, Clone)]
pub struct BurstAccumulator {
    window_samples: u64,
    max_windows: usize,
    current_window: u64,
    current_count: u32,
    completed: VecDeque<u32>,
}

impl BurstAccumulator {
    pub fn new(window_samples: u64, max_windows: usize) -> Self {
        Self {
            window_samples: window_samples.max(1),
            max_windows: max_windows.max(1),
            current_window: 0,
            current_count: 0,
            completed: VecDeque::new(),
        }
    }

    /// Close every window that ends at or before `sample_count`
    pub fn advance_to(&mut self, sample_count: u64) {
        let window = sample_count / self.window_samples;
        while self.current_window < window {
            self.completed.push_back(self.current_count);
            if self.completed.len() > self.max_windows {
                self.completed.pop_front();
            }
            self.current_count = 0;
            self.current_window += 1;
            // A long gap only needs enough empty windows to flush the average
            if window - self.current_window > self.max_windows as u64 {
                self.completed.clear();
                self.completed.extend(std::iter::repeat(0).take(self.max_windows));
                self.current_window = window;
            }
        }
    }

    pub fn record(&mut self, sample_count: u64) {
        self.advance_to(sample_count);
        self.current_count += 1;
    }

    pub fn current_count(&self) -> u32 {
        self.current_count
    }

    /// Mean spikes per completed window
    pub fn average(&self) -> f64 {
        if self.completed.is_empty() {
            return 0.0;
        }
        self.completed.iter().map(|c| *c as f64).sum::<f64>() / self.completed.len() as f64
    }
}

/// Per-probe burst rates for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstSnapshot {
    /// Spikes per second, averaged over the completed windows
    pub rates_hz: Vec<f64>,
    /// Spikes so far in the open window
    pub current_counts: Vec<u32>,
}

/// Destinations for detected spikes: visualization history, burst rates and
/// a capped diagnostics pool
pub struct SpikeStore {
    history: VecDeque<Spike>,
    history_capacity: usize,
    bursts: Vec<BurstAccumulator>,
    window_seconds: f64,
    diagnostics: Vec<Spike>,
    diagnostics_capacity: usize,
    total: u64,
}

impl SpikeStore {
    pub fn new(num_probes: usize, sample_rate_hz: f64, config: &SpikeConfig) -> Self {
        let window_samples = sample_rate_hz.round().max(1.0) as u64;
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            history_capacity: config.history_capacity.max(1),
            bursts: (0..num_probes)
                .map(|_| BurstAccumulator::new(window_samples, config.burst_windows))
                .collect(),
            window_seconds: window_samples as f64 / sample_rate_hz,
            diagnostics: Vec::new(),
            diagnostics_capacity: config.diagnostics_capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, spike: Spike) {
        if let Some(burst) = self.bursts.get_mut(spike.probe) {
            burst.record(spike.sample_count);
        }
        if self.diagnostics.len() < self.diagnostics_capacity {
            self.diagnostics.push(spike.clone());
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(spike);
        self.total += 1;
    }

    /// Let time pass for every probe, closing empty windows
    pub fn advance_to(&mut self, sample_count: u64) {
        for burst in &mut self.bursts {
            burst.advance_to(sample_count);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Most recent spikes, oldest first
    pub fn history(&self) -> Vec<Spike> {
        self.history.iter().cloned().collect()
    }

    pub fn history_for(&self, probe: usize) -> Vec<Spike> {
        self.history.iter().filter(|s| s.probe == probe).cloned().collect()
    }

    pub fn burst_snapshot(&self) -> BurstSnapshot {
        BurstSnapshot {
            rates_hz: self.bursts.iter().map(|b| b.average() / self.window_seconds).collect(),
            current_counts: self.bursts.iter().map(|b| b.current_count()).collect(),
        }
    }

    pub fn diagnostics(&self) -> &[Spike] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Spike> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.diagnostics.clear();
        let window_samples = self.bursts.first().map(|b| b.window_samples).unwrap_or(1);
        let max_windows = self.bursts.first().map(|b| b.max_windows).unwrap_or(1);
        for burst in &mut self.bursts {
            *burst = BurstAccumulator::new(window_samples, max_windows);
        }
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spike(probe: usize, sample_count: u64) -> Spike {
        Spike {
            probe,
            sample_count,
            min_uv: -50.0,
            max_uv: 10.0,
            min_offset: 0,
            max_offset: 1,
            waveform: vec![-50.0, 10.0],
            clock_ticks: 0,
            monotonic_ns: 0,
            wall_clock_ns: 0,
        }
    }

    fn store(history: usize, diagnostics: usize) -> SpikeStore {
        let config = SpikeConfig {
            history_capacity: history,
            diagnostics_capacity: diagnostics,
            burst_windows: 2,
            ..SpikeConfig::default()
        };
        SpikeStore::new(2, 100.0, &config)
    }

    #[test]
    fn test_history_is_bounded() {
        let mut store = store(3, 100);
        for i in 0..5 {
            store.push(spike(0, i));
        }
        let counts: Vec<u64> = store.history().iter().map(|s| s.sample_count).collect();
        assert_eq!(counts, vec![2, 3, 4]);
        assert_eq!(store.total(), 5);
    }

    #[test]
    fn test_diagnostics_capped() {
        let mut store = store(10, 2);
        for i in 0..5 {
            store.push(spike(1, i));
        }
        assert_eq!(store.diagnostics().len(), 2);
        assert_eq!(store.take_diagnostics().len(), 2);
        assert!(store.diagnostics().is_empty());
    }

    #[test]
    fn test_burst_moving_average() {
        let mut store = store(10, 10);
        // window 0: 4 spikes, window 1: 2 spikes
        for c in [1, 20, 40, 60, 120, 150] {
            store.push(spike(0, c));
        }
        store.advance_to(200);

        let snapshot = store.burst_snapshot();
        assert_eq!(snapshot.rates_hz[0], 3.0);
        assert_eq!(snapshot.rates_hz[1], 0.0);
        assert_eq!(snapshot.current_counts[0], 0);

        // two quiet windows push the average to zero
        store.advance_to(400);
        assert_eq!(store.burst_snapshot().rates_hz[0], 0.0);
    }

    #[test]
    fn test_long_gap_flushes() {
        let mut acc = BurstAccumulator::new(10, 3);
        acc.record(5);
        acc.advance_to(1_000_000);
        assert_eq!(acc.average(), 0.0);
    }
}
