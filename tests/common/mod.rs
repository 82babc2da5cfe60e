#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use loadforge_vu::{HttpRequest, RequestRecord, RunOptions, RunPlan, Transport, VuId};
use parking_lot::Mutex;

/// In-memory stand-in for the shop: answers by request name and records
/// every request it sees.
pub struct FakeShop {
    routes: HashMap<String, RequestRecord>,
    fallback: RequestRecord,
    latency: Duration,
    seen: Mutex<Vec<(VuId, String)>>,
    resets: Mutex<usize>,
}

impl FakeShop {
    pub fn new(fallback: RequestRecord) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
            latency: Duration::from_millis(1),
            seen: Mutex::new(Vec::new()),
            resets: Mutex::new(0),
        }
    }

    pub fn all_ok() -> Self {
        Self::new(RequestRecord::status_only(200))
    }

    pub fn route(mut self, name: &str, response: RequestRecord) -> Self {
        self.routes.insert(name.to_string(), response);
        self
    }

    pub fn count(&self, name: &str) -> usize {
        self.seen.lock().iter().filter(|(_, n)| n == name).count()
    }

    pub fn resets(&self) -> usize {
        *self.resets.lock()
    }

    pub fn vus(&self) -> Vec<VuId> {
        let mut vus: Vec<VuId> = self.seen.lock().iter().map(|(vu, _)| *vu).collect();
        vus.sort();
        vus.dedup();
        vus
    }
}

#[async_trait]
impl Transport for FakeShop {
    async fn send(&self, vu: VuId, request: HttpRequest) -> RequestRecord {
        tokio::time::sleep(self.latency).await;
        self.seen.lock().push((vu, request.name.clone()));
        self.routes
            .get(&request.name)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
            .with_duration(self.latency)
    }

    fn reset_iteration(&self, _vu: VuId) {
        *self.resets.lock() += 1;
    }
}

pub fn plan(file: &str) -> RunPlan {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("plans").join(file);
    RunPlan::load(&path).unwrap()
}

pub fn fast_options() -> RunOptions {
    RunOptions {
        tick: Duration::from_millis(10),
        report_interval: Duration::from_secs(60),
    }
}
