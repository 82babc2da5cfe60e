//! Metrics collector - run-lifetime series shared by every virtual user

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hdrhistogram::{CreationError, Histogram};
use parking_lot::{Mutex, RwLock};

use crate::client::RequestRecord;
use crate::models::metrics::{CheckSummary, MetricsSummary, RateSummary, TrendSummary};

/// Name of the Rate every check result is folded into.
pub const CHECKS: &str = "checks";

/// Built-in series fed by every request a virtual user sends, login included.
pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";

/// Trends keep microseconds at three significant figures, so memory stays
/// bounded however long the run lasts.
const SIGNIFICANT_FIGURES: u8 = 3;

struct Trend {
    hist: Mutex<Histogram<u64>>,
}

impl Trend {
    fn new() -> Result<Self, CreationError> {
        Ok(Self {
            hist: Mutex::new(Histogram::new(SIGNIFICANT_FIGURES)?),
        })
    }

    fn add(&self, value_ms: f64) {
        let us = (value_ms.max(0.0) * 1000.0).round() as u64;
        self.hist.lock().saturating_record(us);
    }

    fn summary(&self) -> TrendSummary {
        TrendSummary::from_histogram(&self.hist.lock())
    }
}

#[derive(Default)]
struct Rate {
    trues: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    fn add(&self, value: bool) {
        if value {
            self.trues.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> RateSummary {
        let total = self.total.load(Ordering::Relaxed);
        let trues = self.trues.load(Ordering::Relaxed).min(total);
        RateSummary::new(trues, total)
    }
}

#[derive(Default)]
struct CheckTally {
    passes: AtomicU64,
    fails: AtomicU64,
}

#[derive(Default)]
struct Registry {
    trends: RwLock<HashMap<String, Arc<Trend>>>,
    rates: RwLock<HashMap<String, Arc<Rate>>>,
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    checks: RwLock<HashMap<String, Arc<CheckTally>>>,
}

/// Looks a series up under the read lock and only takes the write lock the
/// first time a name is seen.
fn series<T: Default>(map: &RwLock<HashMap<String, Arc<T>>>, name: &str) -> Arc<T> {
    if let Some(existing) = map.read().get(name) {
        return Arc::clone(existing);
    }
    Arc::clone(map.write().entry(name.to_string()).or_default())
}

#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            start_time: Instant::now(),
        }
    }

    /// Adds a sample (milliseconds) to the named Trend.
    pub fn record_duration(&self, name: &str, value: f64) {
        match self.trend(name) {
            Ok(trend) => trend.add(value),
            Err(err) => tracing::warn!(trend = name, "dropping sample, histogram unavailable: {}", err),
        }
    }

    fn trend(&self, name: &str) -> Result<Arc<Trend>, CreationError> {
        if let Some(existing) = self.registry.trends.read().get(name) {
            return Ok(Arc::clone(existing));
        }
        let mut trends = self.registry.trends.write();
        if let Some(existing) = trends.get(name) {
            return Ok(Arc::clone(existing));
        }
        let trend = Arc::new(Trend::new()?);
        trends.insert(name.to_string(), Arc::clone(&trend));
        Ok(trend)
    }

    pub fn record_boolean(&self, name: &str, value: bool) {
        series(&self.registry.rates, name).add(value);
    }

    pub fn add_count(&self, name: &str, n: u64) {
        series(&self.registry.counters, name).fetch_add(n, Ordering::Relaxed);
    }

    /// Counts one response in the built-in HTTP series.
    pub fn record_request(&self, record: &RequestRecord) {
        self.add_count(HTTP_REQS, 1);
        self.record_duration(HTTP_REQ_DURATION, record.duration_ms());
        self.record_boolean(HTTP_REQ_FAILED, record.is_failed());
    }

    /// Feeds one check outcome into the `checks` Rate and the per-check tally.
    pub fn record_check(&self, name: &str, passed: bool) {
        self.record_boolean(CHECKS, passed);
        let tally = series(&self.registry.checks, name);
        if passed {
            tally.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            tally.fails.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        // clone the handles first so no map lock is held while series are read
        let trends: Vec<(String, Arc<Trend>)> = clone_entries(&self.registry.trends);
        let rates: Vec<(String, Arc<Rate>)> = clone_entries(&self.registry.rates);
        let counters: Vec<(String, Arc<AtomicU64>)> = clone_entries(&self.registry.counters);
        let checks: Vec<(String, Arc<CheckTally>)> = clone_entries(&self.registry.checks);

        MetricsSummary {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            trends: trends.into_iter().map(|(k, t)| (k, t.summary())).collect(),
            rates: rates.into_iter().map(|(k, r)| (k, r.summary())).collect(),
            counters: counters
                .into_iter()
                .map(|(k, c)| (k, c.load(Ordering::Relaxed)))
                .collect(),
            checks: checks
                .into_iter()
                .map(|(k, c)| {
                    (
                        k,
                        CheckSummary {
                            passes: c.passes.load(Ordering::Relaxed),
                            fails: c.fails.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
        }
    }
}

fn clone_entries<T>(map: &RwLock<HashMap<String, Arc<T>>>) -> Vec<(String, Arc<T>)> {
    map.read()
        .iter()
        .map(|(k, v)| (k.clone(), Arc::clone(v)))
        .collect()
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
