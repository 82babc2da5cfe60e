//! Pass/fail criteria evaluated against the final summary.
//!
//! Expressions follow k6 syntax: `rate<0.01`, `p(95)<1000`, `avg<=200`,
//! `count>100`. The left side picks an aggregation of the named series, the
//! right side is a literal.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::ConfigError;
use crate::models::metrics::MetricsSummary;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Avg,
    Min,
    Med,
    Max,
    Percentile(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparator {
    fn holds(self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Lt => observed < limit,
            Self::Le => observed <= limit,
            Self::Gt => observed > limit,
            Self::Ge => observed >= limit,
            Self::Eq => (observed - limit).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    aggregation: Aggregation,
    comparator: Comparator,
    limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// `None` when the series never received a sample.
    pub observed: Option<f64>,
    pub passed: bool,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.observed {
            Some(v) => write!(f, "{} {} (observed {:.4})", self.metric, self.expression, v),
            None => write!(f, "{} {} (no samples)", self.metric, self.expression),
        }
    }
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = compact
            .find(|c| matches!(c, '<' | '>' | '='))
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (lhs, rest) = compact.split_at(op_at);

        let (comparator, rhs) = if let Some(r) = rest.strip_prefix("<=") {
            (Comparator::Le, r)
        } else if let Some(r) = rest.strip_prefix(">=") {
            (Comparator::Ge, r)
        } else if let Some(r) = rest.strip_prefix("==") {
            (Comparator::Eq, r)
        } else if let Some(r) = rest.strip_prefix('<') {
            (Comparator::Lt, r)
        } else if let Some(r) = rest.strip_prefix('>') {
            (Comparator::Gt, r)
        } else {
            return Err(invalid("unknown comparison operator"));
        };

        let limit: f64 = rhs.parse().map_err(|_| invalid("right side is not a number"))?;

        let aggregation = match lhs {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "med" => Aggregation::Med,
            "max" => Aggregation::Max,
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| invalid("unknown aggregation"))?;
                let p: f64 = inner.parse().map_err(|_| invalid("percentile is not a number"))?;
                if ![50.0, 90.0, 95.0, 99.0].contains(&p) {
                    return Err(invalid("supported percentiles are p(50), p(90), p(95) and p(99)"));
                }
                Aggregation::Percentile(p)
            }
        };

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.to_string(),
            aggregation,
            comparator,
            limit,
        })
    }

    fn observe(&self, summary: &MetricsSummary) -> Option<f64> {
        if let Some(trend) = summary.trend(&self.metric) {
            if trend.count == 0 {
                return None;
            }
            return match self.aggregation {
                Aggregation::Count => Some(trend.count as f64),
                Aggregation::Avg => Some(trend.mean),
                Aggregation::Min => Some(trend.min),
                Aggregation::Med => Some(trend.med),
                Aggregation::Max => Some(trend.max),
                Aggregation::Percentile(p) if p == 50.0 => Some(trend.med),
                Aggregation::Percentile(p) if p == 90.0 => Some(trend.p90),
                Aggregation::Percentile(p) if p == 95.0 => Some(trend.p95),
                Aggregation::Percentile(_) => Some(trend.p99),
                Aggregation::Rate => None,
            };
        }

        if let Some(rate) = summary.rate(&self.metric) {
            if rate.total == 0 {
                return None;
            }
            return match self.aggregation {
                Aggregation::Rate => Some(rate.rate),
                Aggregation::Count => Some(rate.trues as f64),
                _ => None,
            };
        }

        if summary.counters.contains_key(&self.metric) {
            return match self.aggregation {
                Aggregation::Count => Some(summary.counter(&self.metric) as f64),
                Aggregation::Rate => Some(summary.throughput(&self.metric)),
                _ => None,
            };
        }

        None
    }

    pub fn evaluate(&self, summary: &MetricsSummary) -> ThresholdResult {
        let observed = self.observe(summary);
        let passed = observed
            .map(|v| self.comparator.holds(v, self.limit))
            .unwrap_or(true);

        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            passed,
        }
    }
}

/// Parses a `metric -> [expressions]` table as found in plan files.
pub fn parse_all(table: &BTreeMap<String, Vec<String>>) -> Result<Vec<Threshold>, ConfigError> {
    table
        .iter()
        .flat_map(|(metric, exprs)| exprs.iter().map(move |e| Threshold::parse(metric, e)))
        .collect()
}

pub fn evaluate_all(thresholds: &[Threshold], summary: &MetricsSummary) -> Vec<ThresholdResult> {
    thresholds.iter().map(|t| t.evaluate(summary)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::collector::MetricsCollector;

    fn summary() -> MetricsSummary {
        let collector = MetricsCollector::new();
        for ms in 1..=100 {
            collector.record_duration("http_req_duration", ms as f64 * 10.0);
        }
        for i in 0..200 {
            collector.record_boolean("http_req_failed", i == 0);
        }
        collector.add_count("iterations", 42);
        collector.summary()
    }

    #[test]
    fn test_parse_k6_expressions() {
        assert!(Threshold::parse("http_req_failed", "rate<0.01").is_ok());
        assert!(Threshold::parse("http_req_duration", "p(95)<1000").is_ok());
        assert!(Threshold::parse("http_req_duration", "avg <= 200").is_ok());
        assert!(Threshold::parse("iterations", "count>10").is_ok());
    }

    #[test]
    fn test_reject_malformed() {
        assert!(Threshold::parse("x", "rate").is_err());
        assert!(Threshold::parse("x", "rate<abc").is_err());
        assert!(Threshold::parse("x", "p(42)<10").is_err());
        assert!(Threshold::parse("x", "median<10").is_err());
    }

    #[test]
    fn test_evaluate() {
        let summary = summary();

        let failed = Threshold::parse("http_req_failed", "rate<0.01").unwrap().evaluate(&summary);
        assert!(failed.passed);
        assert_eq!(failed.observed, Some(0.005));

        let p95 = Threshold::parse("http_req_duration", "p(95)<900").unwrap().evaluate(&summary);
        assert!(!p95.passed);

        let count = Threshold::parse("iterations", "count>=42").unwrap().evaluate(&summary);
        assert!(count.passed);
    }

    #[test]
    fn test_missing_series_passes() {
        let result = Threshold::parse("login_fail", "rate<0.01").unwrap().evaluate(&summary());
        assert!(result.passed);
        assert_eq!(result.observed, None);
    }

    #[test]
    fn test_parse_table() {
        let mut table = BTreeMap::new();
        table.insert("http_req_failed".to_string(), vec!["rate<0.01".to_string()]);
        table.insert("http_req_duration".to_string(), vec!["p(95)<1000".to_string(), "max<5000".to_string()]);
        assert_eq!(parse_all(&table).unwrap().len(), 3);

        table.insert("broken".to_string(), vec!["nope".to_string()]);
        assert!(parse_all(&table).is_err());
    }
}
