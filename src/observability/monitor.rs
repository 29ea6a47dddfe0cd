use super::MetricsCollector;

pub struct KernelMonitor {
    collector: MetricsCollector,
}

impl KernelMonitor {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }

    pub fn generate_report(&self) -> String {
        let snapshot = self.collector.snapshot();

        if snapshot.is_empty() {
            return "No stages registered".to_string();
        }

        let mut report = String::from("=== Acquisition Metrics ===\n");

        for (stage, metrics) in snapshot.iter() {
            report.push_str(&format!(
                "\n[{}]\n  Frames: {}\n  Faults: {}\n  Dropped: {}\n  Avg Latency: {}μs\n",
                stage,
                metrics.frames_processed,
                metrics.faults_count,
                metrics.dropped_count,
                metrics.avg_latency_us
            ));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_stages() {
        let mut collector = MetricsCollector::new();
        collector.stage("synchronizer").record_fault();
        let report = KernelMonitor::new(collector).generate_report();

        assert!(report.contains("[synchronizer]"));
        assert!(report.contains("Faults: 1"));
    }

    #[test]
    fn test_empty_report() {
        let report = KernelMonitor::new(MetricsCollector::new()).generate_report();
        assert_eq!(report, "No stages registered");
    }
}
