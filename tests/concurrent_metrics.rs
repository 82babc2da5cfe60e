use std::sync::Arc;

use loadforge_vu::MetricsCollector;
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_lost_updates_across_tasks() {
    const WORKERS: usize = 64;
    const SAMPLES: usize = 500;

    let collector = MetricsCollector::new();
    let barrier = Arc::new(Barrier::new(WORKERS));
    let mut handles = Vec::new();

    for worker in 0..WORKERS {
        let collector = collector.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            for i in 0..SAMPLES {
                collector.record_duration("http_req_duration", (worker * SAMPLES + i) as f64);
                collector.record_boolean("http_req_failed", i % 4 == 0);
                collector.add_count("http_reqs", 1);
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let summary = collector.summary();
    let total = (WORKERS * SAMPLES) as u64;
    assert_eq!(summary.trend("http_req_duration").unwrap().count, total);
    assert_eq!(summary.counter("http_reqs"), total);
    let failed = summary.rate("http_req_failed").unwrap();
    assert_eq!(failed.total, total);
    assert_eq!(failed.rate, 0.25);
}
