use serde::{Deserialize, Serialize};

/// Per-probe running statistics used for spike thresholds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeStatistics {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    /// Sum of squared deviation from the mean
    pub sum_sq_dev: f64,
    /// Sample variance (n - 1 denominator), zero below two samples
    pub variance: f64,
    pub deviation: f64,
}

impl ProbeStatistics {
    pub fn from_samples(samples: &[f32]) -> Self {
        let count = samples.len();
        if count == 0 {
            return Self::default();
        }

        let sum: f64 = samples.iter().map(|v| *v as f64).sum();
        let mean = sum / count as f64;
        let sum_sq_dev: f64 = samples
            .iter()
            .map(|v| {
                let d = *v as f64 - mean;
                d * d
            })
            .sum();
        let variance = if count > 1 {
            sum_sq_dev / (count - 1) as f64
        } else {
            0.0
        };

        Self {
            count,
            sum,
            mean,
            sum_sq_dev,
            variance,
            deviation: variance.sqrt(),
        }
    }

    /// `mean - k * deviation`
    pub fn lower_threshold(&self, k: f64) -> f64 {
        self.mean - k * self.deviation
    }

    /// `mean + k * deviation`
    pub fn upper_threshold(&self, k: f64) -> f64 {
        self.mean + k * self.deviation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_signal() {
        let stats = ProbeStatistics::from_samples(&[3.5; 100]);
        assert_eq!(stats.mean, 3.5);
        assert_eq!(stats.variance, 0.0);
        assert_eq!(stats.deviation, 0.0);
    }

    #[test]
    fn test_sample_variance() {
        let stats = ProbeStatistics::from_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.sum_sq_dev, 5.0);
        assert!((stats.variance - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_sample() {
        let stats = ProbeStatistics::from_samples(&[7.0]);
        assert_eq!(stats.mean, 7.0);
        assert_eq!(stats.variance, 0.0);
        assert_eq!(ProbeStatistics::from_samples(&[]).count, 0);
    }
}
