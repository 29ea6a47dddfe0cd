use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free counters for one processing stage
pub struct StageMetrics {
    stage: String,
    frames_processed: AtomicU64,
    faults_count: AtomicU64,
    dropped_count: AtomicU64,
    total_latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl StageMetrics {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            frames_processed: AtomicU64::new(0),
            faults_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn faults_count(&self) -> u64 {
        self.faults_count.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn record_frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn start_processing(&self) -> Instant {
        Instant::now()
    }

    pub fn finish_processing(&self, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_us(&self) -> u64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = StageMetrics::new("sync");
        metrics.record_frame_processed();
        metrics.record_frame_processed();
        metrics.record_fault();
        metrics.record_dropped(3);

        assert_eq!(metrics.frames_processed(), 2);
        assert_eq!(metrics.faults_count(), 1);
        assert_eq!(metrics.dropped_count(), 3);
        assert_eq!(metrics.avg_latency_us(), 0);
    }
}
