use std::collections::BTreeMap;

use hdrhistogram::Histogram;
use serde::Serialize;

/// Distribution statistics of a Trend, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl TrendSummary {
    /// Summarises a histogram of microsecond samples, reported in milliseconds.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }

        let ms = |us: u64| us as f64 / 1000.0;
        Self {
            count: hist.len(),
            mean: hist.mean() / 1000.0,
            min: ms(hist.min()),
            med: ms(hist.value_at_quantile(0.50)),
            p90: ms(hist.value_at_quantile(0.90)),
            p95: ms(hist.value_at_quantile(0.95)),
            p99: ms(hist.value_at_quantile(0.99)),
            max: ms(hist.max()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateSummary {
    pub rate: f64,
    pub trues: u64,
    pub total: u64,
}

impl RateSummary {
    pub fn new(trues: u64, total: u64) -> Self {
        let rate = if total == 0 {
            0.0
        } else {
            trues as f64 / total as f64
        };
        Self { rate, trues, total }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckSummary {
    pub passes: u64,
    pub fails: u64,
}

impl CheckSummary {
    pub fn pass_rate(&self) -> f64 {
        let total = self.passes + self.fails;
        if total == 0 {
            return 0.0;
        }
        self.passes as f64 / total as f64
    }
}

/// Point-in-time view of every series the collector knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub elapsed_secs: f64,
    pub trends: BTreeMap<String, TrendSummary>,
    pub rates: BTreeMap<String, RateSummary>,
    pub counters: BTreeMap<String, u64>,
    pub checks: BTreeMap<String, CheckSummary>,
}

impl MetricsSummary {
    pub fn trend(&self, name: &str) -> Option<&TrendSummary> {
        self.trends.get(name)
    }

    pub fn rate(&self, name: &str) -> Option<&RateSummary> {
        self.rates.get(name)
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn check(&self, name: &str) -> Option<&CheckSummary> {
        self.checks.get(name)
    }

    /// Requests per second over the elapsed run time.
    pub fn throughput(&self, counter: &str) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.counter(counter) as f64 / self.elapsed_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(samples_ms: impl IntoIterator<Item = u64>) -> Histogram<u64> {
        let mut hist = Histogram::new(3).unwrap();
        for ms in samples_ms {
            hist.record(ms * 1000).unwrap();
        }
        hist
    }

    fn close(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() <= expected.abs() * 0.001 + 1e-9
    }

    #[test]
    fn test_percentiles() {
        let summary = TrendSummary::from_histogram(&histogram(1..=100));

        assert_eq!(summary.count, 100);
        assert!(close(summary.mean, 50.5), "{}", summary.mean);
        assert!(close(summary.min, 1.0), "{}", summary.min);
        assert!(close(summary.max, 100.0), "{}", summary.max);
        assert!(close(summary.med, 50.0), "{}", summary.med);
        assert!(close(summary.p90, 90.0), "{}", summary.p90);
        assert!(close(summary.p95, 95.0), "{}", summary.p95);
        assert!(close(summary.p99, 99.0), "{}", summary.p99);
    }

    #[test]
    fn test_single_sample() {
        let summary = TrendSummary::from_histogram(&histogram([42]));
        assert!(close(summary.p99, 42.0));
        assert!(close(summary.med, 42.0));
        assert_eq!(summary.count, 1);
    }

    #[test]
    fn test_empty() {
        assert_eq!(TrendSummary::from_histogram(&histogram([])), TrendSummary::default());
        assert_eq!(RateSummary::new(0, 0).rate, 0.0);
    }

    #[test]
    fn test_rate() {
        let rate = RateSummary::new(1, 4);
        assert_eq!(rate.rate, 0.25);
    }
}
