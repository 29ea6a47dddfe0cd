use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::ring::SampleRing;
use super::stats::ProbeStatistics;
use crate::config::BufferConfig;
use crate::core::{FrameSink, SyncedCycle};
use crate::error::ConfigurationError;
use crate::observability::StageMetrics;

/// Dense and sparse sample history plus per-probe statistics.
///
/// Each ring has its own lock and statistics sit behind a third one, so the
/// statistics worker never contends with the ingestion path on the dense
/// buffer.
pub struct RingBufferEngine {
    num_probes: usize,
    decimation: usize,
    dense: Mutex<SampleRing>,
    sparse: Mutex<SampleRing>,
    stats: RwLock<Vec<ProbeStatistics>>,
    new_data: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    metrics: Arc<StageMetrics>,
}

fn lock(ring: &Mutex<SampleRing>) -> MutexGuard<'_, SampleRing> {
    ring.lock().unwrap_or_else(|p| p.into_inner())
}

impl RingBufferEngine {
    pub fn new(num_probes: usize, config: &BufferConfig, metrics: Arc<StageMetrics>) -> Result<Self, ConfigurationError> {
        Self::check_sizes(config)?;
        // One pending wake-up is enough, the worker drains everything new
        let (wake_tx, wake_rx) = bounded(1);

        Ok(Self {
            num_probes,
            decimation: config.sparse_decimation,
            dense: Mutex::new(SampleRing::new(num_probes, config.dense_samples)),
            sparse: Mutex::new(SampleRing::new(num_probes, config.sparse_samples)),
            stats: RwLock::new(vec![ProbeStatistics::default(); num_probes]),
            new_data: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            metrics,
        })
    }

    fn check_sizes(config: &BufferConfig) -> Result<(), ConfigurationError> {
        if config.dense_samples == 0 || config.sparse_samples == 0 {
            return Err(ConfigurationError::Buffer("buffer sizes must be nonzero".to_string()));
        }
        if config.sparse_decimation == 0 {
            return Err(ConfigurationError::Buffer("sparse decimation must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn num_probes(&self) -> usize {
        self.num_probes
    }

    pub fn push(&self, cycle: &SyncedCycle) {
        let start = self.metrics.start_processing();
        let count = {
            let mut dense = lock(&self.dense);
            dense.push(&cycle.frame);
            dense.count()
        };

        if (count - 1) % self.decimation as u64 == 0 {
            lock(&self.sparse).push(&cycle.frame);
        }

        self.new_data.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        self.metrics.record_frame_processed();
        self.metrics.finish_processing(start);
    }

    /// True once after any push; consumers poll this for redraws
    pub fn take_new_data(&self) -> bool {
        self.new_data.swap(false, Ordering::AcqRel)
    }

    /// Wake-ups posted after each push
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    pub fn dense_count(&self) -> u64 {
        lock(&self.dense).count()
    }

    pub fn sparse_count(&self) -> u64 {
        lock(&self.sparse).count()
    }

    /// Run `f` with the dense buffer locked; keep it short
    pub fn with_dense<R>(&self, f: impl FnOnce(&SampleRing) -> R) -> R {
        f(&lock(&self.dense))
    }

    pub fn with_sparse<R>(&self, f: impl FnOnce(&SampleRing) -> R) -> R {
        f(&lock(&self.sparse))
    }

    /// Copy of a dense AC window
    pub fn window(&self, probe: usize, start_count: u64, len: usize) -> Option<Vec<f32>> {
        lock(&self.dense).window(probe, start_count, len).map(|w| w.to_vec())
    }

    pub fn mark_spike(&self, probe: usize, count: u64) -> bool {
        lock(&self.dense).mark_spike(probe, count)
    }

    /// Recompute per-probe statistics over the whole sparse buffer
    pub fn recompute_thresholds(&self) -> Vec<ProbeStatistics> {
        let fresh: Vec<ProbeStatistics> = {
            let sparse = lock(&self.sparse);
            let n = sparse.filled();
            let start = sparse.count() - n as u64;
            (0..self.num_probes)
                .map(|probe| {
                    sparse
                        .window(probe, start, n)
                        .map(ProbeStatistics::from_samples)
                        .unwrap_or_default()
                })
                .collect()
        };

        *self.stats.write().unwrap_or_else(|p| p.into_inner()) = fresh.clone();
        debug!("Recomputed statistics for {} probes", fresh.len());
        fresh
    }

    pub fn probe_stats(&self) -> Vec<ProbeStatistics> {
        self.stats.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn probe_stat(&self, probe: usize) -> Option<ProbeStatistics> {
        self.stats.read().unwrap_or_else(|p| p.into_inner()).get(probe).copied()
    }

    /// Replace all storage; history and statistics are discarded
    pub fn resize(&self, config: &BufferConfig) -> Result<(), ConfigurationError> {
        Self::check_sizes(config)?;
        if config.sparse_decimation != self.decimation {
            return Err(ConfigurationError::Buffer(
                "sparse decimation is fixed at construction".to_string(),
            ));
        }

        let mut dense = lock(&self.dense);
        let mut sparse = lock(&self.sparse);
        *dense = SampleRing::new(self.num_probes, config.dense_samples);
        *sparse = SampleRing::new(self.num_probes, config.sparse_samples);
        *self.stats.write().unwrap_or_else(|p| p.into_inner()) =
            vec![ProbeStatistics::default(); self.num_probes];

        info!(
            "Resized buffers to {} dense / {} sparse samples",
            config.dense_samples, config.sparse_samples
        );
        Ok(())
    }
}

impl FrameSink for RingBufferEngine {
    fn name(&self) -> &str {
        "buffers"
    }

    fn on_frame(&self, cycle: &SyncedCycle) {
        self.push(cycle);
    }
}
