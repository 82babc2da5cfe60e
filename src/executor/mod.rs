use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Transport;
use crate::error::EngineError;
use crate::metrics::collector::MetricsCollector;
use crate::metrics::thresholds::{self, Threshold, ThresholdResult};
use crate::models::dsl_model::RunPlan;
use crate::models::metrics::MetricsSummary;
use crate::scenario::{IterationOutcome, Scenario, ScenarioExecutor, HTTP_REQS, ITERATIONS};
use crate::scheduler::{LoadSchedule, RampSchedule};
use crate::session::{VirtualUser, VuId};
use crate::utils::hardware::{get_hardware_info, HostInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Ramping,
    Steady,
    RampingDown,
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Ramping => "ramping",
            Self::Steady => "steady",
            Self::RampingDown => "ramping down",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How often the control loop re-reads the schedule.
    pub tick: Duration,
    /// Interval between progress log lines.
    pub report_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            report_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub state: RunState,
    pub elapsed_secs: f64,
    pub peak_vus: u32,
    pub summary: MetricsSummary,
    pub thresholds: Vec<ThresholdResult>,
    pub host: HostInfo,
}

impl RunReport {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }
}

/// Hands out 1-based VU ids. A freed id is reused before a new one is
/// minted, lowest first, so ids stay dense across ramp cycles.
#[derive(Debug, Default)]
struct VuIds {
    next: u64,
    free: BTreeSet<u64>,
}

impl VuIds {
    fn acquire(&mut self) -> VuId {
        match self.free.pop_first() {
            Some(id) => VuId(id),
            None => {
                self.next += 1;
                VuId(self.next)
            }
        }
    }

    fn release(&mut self, id: VuId) {
        self.free.insert(id.0);
    }
}

struct Worker {
    id: VuId,
    /// Finish the current iteration, then exit.
    stop: CancellationToken,
    /// Drop the in-flight iteration immediately.
    abandon: CancellationToken,
    handle: JoinHandle<()>,
    deadline: Option<Instant>,
}

impl Worker {
    fn request_stop(&mut self, grace: Duration) {
        self.stop.cancel();
        self.deadline = Some(Instant::now() + grace);
    }
}

fn reap(workers: &mut Vec<Worker>, ids: &mut VuIds) {
    workers.retain(|w| {
        if w.handle.is_finished() {
            ids.release(w.id);
            false
        } else {
            true
        }
    });
}

fn abandon_overdue(workers: &[Worker]) {
    let now = Instant::now();
    for worker in workers {
        if worker.deadline.is_some_and(|d| now >= d) && !worker.abandon.is_cancelled() {
            warn!(vu = %worker.id, "graceful stop expired, abandoning iteration");
            worker.abandon.cancel();
        }
    }
}

/// Direction of the stage that covers `elapsed`.
fn ramp_phase(ramp: &RampSchedule, elapsed: Duration) -> RunState {
    let Some(idx) = ramp.stage_index(elapsed) else {
        return RunState::RampingDown;
    };
    let from = match idx {
        0 => ramp.start_vus,
        _ => ramp.stages[idx - 1].target,
    };
    match ramp.stages[idx].target.cmp(&from) {
        std::cmp::Ordering::Greater => RunState::Ramping,
        std::cmp::Ordering::Less => RunState::RampingDown,
        std::cmp::Ordering::Equal => RunState::Steady,
    }
}

async fn vu_loop(
    executor: ScenarioExecutor,
    mut vu: VirtualUser,
    stop: CancellationToken,
    abandon: CancellationToken,
    max_iterations: Option<u64>,
) {
    let id = vu.id;
    let think_time = executor.think_time();
    let done = |vu: &VirtualUser| max_iterations.is_some_and(|max| vu.iterations >= max);

    while !stop.is_cancelled() && !done(&vu) {
        let outcome = tokio::select! {
            _ = abandon.cancelled() => break,
            outcome = async {
                executor.start_jitter().await;
                executor.run_iteration(&mut vu).await
            } => outcome,
        };

        match outcome {
            Ok(IterationOutcome::Completed) => {}
            Ok(IterationOutcome::EndedEarly { step, reason }) => {
                debug!(vu = %id, step = %step, reason = %reason, "iteration ended early");
            }
            Err(err) => warn!(vu = %id, "{}", err),
        }

        // the pause also follows a worker's last iteration, before teardown
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = abandon.cancelled() => break,
            _ = sleep(think_time) => {}
        }
    }

    executor.transport().release(id);
    debug!(vu = %id, iterations = vu.iterations, "virtual user finished");
}

/// Drives one run: polls the schedule, grows and shrinks the worker set,
/// winds down, then evaluates thresholds.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    options: RunOptions,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            transport,
            options: RunOptions::default(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Cancelling this token aborts the run: in-flight iterations are
    /// dropped and the report is produced with state `Aborted`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    fn set_state(&self, next: RunState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "run state changed");
        }
    }

    pub async fn run(&self, plan: &RunPlan) -> Result<RunReport, EngineError> {
        let thresholds = match plan.validate() {
            Ok(thresholds) => thresholds,
            Err(err) => {
                error!(plan = %plan.name, "{}", err);
                self.set_state(RunState::Aborted);
                return Err(err.into());
            }
        };

        self.execute(
            &plan.name,
            plan.scenario(),
            plan.executor.clone(),
            plan.graceful_ramp_down,
            thresholds,
        )
        .await
    }

    pub async fn execute(
        &self,
        name: &str,
        scenario: Scenario,
        schedule: LoadSchedule,
        graceful_stop: Duration,
        thresholds: Vec<Threshold>,
    ) -> Result<RunReport, EngineError> {
        if let Err(err) = schedule.validate().and_then(|_| scenario.validate()) {
            error!(run = name, "{}", err);
            self.set_state(RunState::Aborted);
            return Err(err.into());
        }

        let collector = MetricsCollector::new();
        let executor = ScenarioExecutor::new(Arc::new(scenario), Arc::clone(&self.transport), collector.clone());
        let max_iterations = schedule.iterations_per_vu();
        let hard_stop = CancellationToken::new();

        let mut ids = VuIds::default();
        let mut active: Vec<Worker> = Vec::new();
        let mut stopping: Vec<Worker> = Vec::new();
        let mut peak_vus = 0u32;
        let mut spawned = false;
        let mut aborted = false;

        let spawn = |ids: &mut VuIds| -> Worker {
            let id = ids.acquire();
            let stop = CancellationToken::new();
            let abandon = hard_stop.child_token();
            let handle = tokio::spawn(vu_loop(
                executor.clone(),
                VirtualUser::new(id),
                stop.clone(),
                abandon.clone(),
                max_iterations,
            ));
            debug!(vu = %id, "spawned virtual user");
            Worker {
                id,
                stop,
                abandon,
                handle,
                deadline: None,
            }
        };

        info!(
            run = name,
            schedule = %schedule.description(),
            max_vus = schedule.max_vus(),
            planned_iterations = ?schedule.total_iterations(),
            "starting run"
        );
        let started = Instant::now();
        let mut last_progress = started;
        let mut ticker = interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = started.elapsed();
            reap(&mut active, &mut ids);
            reap(&mut stopping, &mut ids);
            abandon_overdue(&stopping);

            let finished = match &schedule {
                LoadSchedule::RampingVus(ramp) => ramp.is_exhausted(elapsed),
                LoadSchedule::PerVuIterations(spec) => {
                    if spec.max_duration.is_some_and(|max| elapsed >= max) {
                        info!(run = name, "max duration reached");
                        true
                    } else {
                        spawned && active.is_empty()
                    }
                }
            };
            if finished {
                break;
            }

            let target = match &schedule {
                // per-vu workers exit once their iterations are spent and are not replaced
                LoadSchedule::PerVuIterations(_) if spawned => active.len(),
                _ => schedule.target_at(elapsed) as usize,
            };
            while active.len() < target {
                active.push(spawn(&mut ids));
            }
            while active.len() > target {
                if let Some(mut worker) = active.pop() {
                    worker.request_stop(graceful_stop);
                    stopping.push(worker);
                }
            }
            spawned = true;
            self.set_state(match &schedule {
                LoadSchedule::RampingVus(ramp) => ramp_phase(ramp, elapsed),
                LoadSchedule::PerVuIterations(_) => RunState::Steady,
            });

            peak_vus = peak_vus.max(active.len() as u32);

            if last_progress.elapsed() >= self.options.report_interval {
                last_progress = Instant::now();
                let summary = collector.summary();
                info!(
                    elapsed = %format!("{:.0}s", elapsed.as_secs_f64()),
                    vus = active.len() as u64,
                    stopping = stopping.len() as u64,
                    iterations = summary.counter(ITERATIONS),
                    http_reqs = summary.counter(HTTP_REQS),
                    "progress"
                );
            }
        }

        if !aborted {
            self.set_state(RunState::RampingDown);
            for mut worker in active.drain(..) {
                worker.request_stop(graceful_stop);
                stopping.push(worker);
            }

            loop {
                stopping.retain(|w| !w.handle.is_finished());
                if stopping.is_empty() {
                    break;
                }
                abandon_overdue(&stopping);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        aborted = true;
                        break;
                    }
                    _ = sleep(self.options.tick) => {}
                }
            }
        }

        if aborted {
            warn!(run = name, "run aborted, abandoning in-flight iterations");
            hard_stop.cancel();
        }
        for worker in active.into_iter().chain(stopping) {
            if let Err(err) = worker.handle.await {
                error!(vu = %worker.id, "virtual user task failed: {}", err);
            }
        }

        self.set_state(if aborted { RunState::Aborted } else { RunState::Completed });

        let summary = collector.summary();
        let results = thresholds::evaluate_all(&thresholds, &summary);
        for result in results.iter().filter(|r| !r.passed) {
            warn!(threshold = %result, "threshold crossed");
        }

        let host = tokio::task::spawn_blocking(get_hardware_info)
            .await
            .unwrap_or_else(|err| {
                warn!("host info unavailable: {}", err);
                HostInfo::default()
            });

        Ok(RunReport {
            name: name.to_string(),
            state: self.state(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            peak_vus,
            summary,
            thresholds: results,
            host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpRequest, RequestRecord};
    use crate::scenario::{Pacing, RequestStep, Step};
    use crate::scheduler::{IterationSpec, Stage};
    use crate::session::LoginConfig;
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        async fn send(&self, _vu: VuId, _request: HttpRequest) -> RequestRecord {
            sleep(Duration::from_millis(2)).await;
            RequestRecord::status_only(200)
        }
    }

    /// Never answers, so every iteration stays in flight.
    struct Hangs;

    #[async_trait]
    impl Transport for Hangs {
        async fn send(&self, _vu: VuId, _request: HttpRequest) -> RequestRecord {
            std::future::pending::<RequestRecord>().await
        }
    }

    fn fast_options() -> RunOptions {
        RunOptions {
            tick: Duration::from_millis(10),
            report_interval: Duration::from_secs(60),
        }
    }

    fn cart_scenario() -> Scenario {
        Scenario::new("cart", "http://shop")
            .with_login(LoginConfig::default())
            .keep_cookies()
            .step(Step::Login)
            .request(RequestStep::get("cart", "/cart").rate("cart_fail"))
            .with_pacing(Pacing {
                start_jitter: None,
                think_time: Duration::from_millis(5),
            })
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_vu_ids_reuse_lowest() {
        let mut ids = VuIds::default();
        let a = ids.acquire();
        let b = ids.acquire();
        let c = ids.acquire();
        assert_eq!((a, b, c), (VuId(1), VuId(2), VuId(3)));

        ids.release(c);
        ids.release(a);
        assert_eq!(ids.acquire(), VuId(1));
        assert_eq!(ids.acquire(), VuId(3));
        assert_eq!(ids.acquire(), VuId(4));
    }

    #[test]
    fn test_ramp_phase() {
        let ramp = RampSchedule::new(0, vec![Stage::new(ms(100), 10), Stage::new(ms(100), 10), Stage::new(ms(100), 0)]);
        assert_eq!(ramp_phase(&ramp, ms(50)), RunState::Ramping);
        assert_eq!(ramp_phase(&ramp, ms(150)), RunState::Steady);
        assert_eq!(ramp_phase(&ramp, ms(250)), RunState::RampingDown);
    }

    #[tokio::test]
    async fn test_invalid_schedule_aborts_before_spawning() {
        let orchestrator = Orchestrator::new(Arc::new(AlwaysOk)).with_options(fast_options());
        let schedule = LoadSchedule::RampingVus(RampSchedule::new(0, vec![]));

        let err = orchestrator
            .execute("empty", cart_scenario(), schedule, ms(100), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(crate::error::ConfigError::EmptyStages)));
        assert_eq!(orchestrator.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_ramping_run_completes() {
        let orchestrator = Orchestrator::new(Arc::new(AlwaysOk)).with_options(fast_options());
        let schedule = LoadSchedule::RampingVus(RampSchedule::new(
            0,
            vec![Stage::new(ms(100), 4), Stage::new(ms(200), 4), Stage::new(ms(100), 0)],
        ));
        let thresholds = vec![Threshold::parse("cart_fail", "rate<0.01").unwrap()];

        let report = orchestrator
            .execute("cart", cart_scenario(), schedule, ms(500), thresholds)
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.peak_vus, 4);
        assert!(report.summary.counter(ITERATIONS) > 0);
        assert_eq!(report.summary.rate("cart_fail").unwrap().rate, 0.0);
        assert!(report.thresholds_passed());
    }

    #[tokio::test]
    async fn test_per_vu_iterations() {
        let orchestrator = Orchestrator::new(Arc::new(AlwaysOk)).with_options(fast_options());
        let schedule = LoadSchedule::PerVuIterations(IterationSpec {
            vus: 3,
            iterations: 4,
            max_duration: Some(Duration::from_secs(10)),
        });

        let scenario = cart_scenario().with_pacing(Pacing {
            start_jitter: None,
            think_time: ms(40),
        });

        let report = orchestrator
            .execute("order-cart", scenario, schedule, ms(500), Vec::new())
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.summary.counter(ITERATIONS), 12);
        // four pauses per worker, the last one before teardown
        assert!(report.elapsed_secs >= 0.16, "{}", report.elapsed_secs);
        // one login per virtual user, then sessions are reused
        assert_eq!(report.summary.trend("login_duration").unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_zero_length_ramp_is_rejected() {
        let orchestrator = Orchestrator::new(Arc::new(AlwaysOk)).with_options(fast_options());
        let schedule = LoadSchedule::RampingVus(RampSchedule::new(0, vec![Stage::new(Duration::ZERO, 25)]));

        let err = orchestrator
            .execute("instant", cart_scenario(), schedule, ms(100), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(crate::error::ConfigError::ZeroDuration)));
    }

    #[tokio::test]
    async fn test_report_carries_host_info() {
        let orchestrator = Orchestrator::new(Arc::new(AlwaysOk)).with_options(fast_options());
        let schedule = LoadSchedule::PerVuIterations(IterationSpec {
            vus: 1,
            iterations: 1,
            max_duration: None,
        });

        let report = orchestrator
            .execute("host", cart_scenario(), schedule, ms(100), Vec::new())
            .await
            .unwrap();
        assert!(report.host.cpu_cores > 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_expires() {
        let orchestrator = Orchestrator::new(Arc::new(Hangs)).with_options(fast_options());
        let schedule = LoadSchedule::RampingVus(RampSchedule::new(2, vec![Stage::new(ms(50), 2)]));

        let started = Instant::now();
        let report = orchestrator
            .execute("stuck", cart_scenario(), schedule, ms(100), Vec::new())
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.summary.counter(ITERATIONS), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_run() {
        let orchestrator = Orchestrator::new(Arc::new(AlwaysOk)).with_options(fast_options());
        let schedule = LoadSchedule::RampingVus(RampSchedule::new(0, vec![Stage::new(Duration::from_secs(60), 5)]));
        let cancel = orchestrator.cancel_token();
        let mut states = orchestrator.subscribe();

        tokio::spawn(async move {
            sleep(ms(150)).await;
            cancel.cancel();
        });

        let report = orchestrator
            .execute("cancelled", cart_scenario(), schedule, Duration::from_secs(30), Vec::new())
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Aborted);
        assert!(report.elapsed_secs < 30.0);
        assert_eq!(*states.borrow_and_update(), RunState::Aborted);
    }
}
