//! Virtual-user HTTP load generation.
//!
//! A [`RunPlan`] describes the target, a concurrency schedule and the steps
//! every virtual user repeats. The [`Orchestrator`] ramps workers along the
//! schedule, each worker drives its own session through the scenario, and
//! every request feeds a shared [`MetricsCollector`] that thresholds are
//! evaluated against once the run winds down.

pub mod checks;
pub mod cli;
pub mod client;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod scenario;
pub mod scheduler;
pub mod session;
pub mod utils;
pub mod ws;

pub use checks::{evaluate_checks, Check, CheckResult};
pub use client::{HttpRequest, HyperTransport, RequestRecord, Transport};
pub use error::{ConfigError, EngineError, IterationError, TransportError};
pub use executor::{Orchestrator, RunOptions, RunReport, RunState};
pub use metrics::collector::MetricsCollector;
pub use models::dsl_model::{PlanOverrides, RunPlan};
pub use scenario::{IterationOutcome, RequestStep, Scenario, ScenarioExecutor, Step};
pub use scheduler::{IterationSpec, LoadSchedule, RampSchedule, Stage};
pub use session::{LoginConfig, SessionState, VirtualUser, VuId};
