use std::collections::BTreeMap;
use std::sync::Arc;
use super::StageMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub stage: String,
    pub frames_processed: u64,
    pub faults_count: u64,
    pub dropped_count: u64,
    pub avg_latency_us: u64,
}

#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: BTreeMap<String, Arc<StageMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage and hand back its shared counters
    pub fn stage(&mut self, stage: &str) -> Arc<StageMetrics> {
        self.metrics
            .entry(stage.to_string())
            .or_insert_with(|| Arc::new(StageMetrics::new(stage)))
            .clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.metrics
            .iter()
            .map(|(id, metrics)| {
                (
                    id.clone(),
                    MetricsSnapshot {
                        stage: metrics.stage().to_string(),
                        frames_processed: metrics.frames_processed(),
                        faults_count: metrics.faults_count(),
                        dropped_count: metrics.dropped_count(),
                        avg_latency_us: metrics.avg_latency_us(),
                    },
                )
            })
            .collect()
    }

    pub fn get_stage_metrics(&self, stage: &str) -> Option<Arc<StageMetrics>> {
        self.metrics.get(stage).cloned()
    }
}
