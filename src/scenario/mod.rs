//! Scenario definition and the per-iteration action executor.
//!
//! An iteration walks the scenario's steps strictly in order. Later steps
//! usually depend on earlier responses (an order id from `pay/prepare` feeds
//! `pay/confirm`), so a step whose response cannot satisfy what follows ends
//! the iteration early instead of sending requests that are bound to fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use crate::checks::{all_passed, evaluate_checks, Check};
use crate::client::{HttpRequest, RequestRecord, Transport};
use crate::error::{ConfigError, IterationError};
use crate::metrics::collector::MetricsCollector;
use crate::models::dsl_model::{Auth, Body, HttpMethod};
use crate::session::{ensure_logged_in, LoginConfig, VirtualUser};
use crate::utils::duration;

pub use crate::metrics::collector::{HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATIONS_ENDED_EARLY: &str = "iterations_ended_early";
pub const ITERATIONS_LOGIN_FAILED: &str = "iterations_login_failed";

#[derive(Debug, Clone, Deserialize)]
pub struct Pacing {
    /// Upper bound of a uniform random delay before every iteration.
    #[serde(default, with = "duration::option")]
    pub start_jitter: Option<Duration>,
    /// Fixed pause after every iteration, however it ended.
    #[serde(default = "default_think_time", with = "duration")]
    pub think_time: Duration,
}

fn default_think_time() -> Duration {
    Duration::from_secs(1)
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            start_jitter: None,
            think_time: default_think_time(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Login,
    Request(RequestStep),
    /// Sleeps `duration`, or a uniform random time up to `max` when set.
    Sleep {
        #[serde(with = "duration")]
        duration: Duration,
        #[serde(default, with = "duration::option")]
        max: Option<Duration>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateSpec {
    pub name: String,
    /// Record `status not in this set` instead of `any check failed`.
    #[serde(default)]
    pub failed_unless_status: Option<Vec<u16>>,
}

/// Pulls a value out of a JSON response into an iteration variable.
#[derive(Debug, Clone, Deserialize)]
pub struct Extraction {
    pub var: String,
    /// JSON pointer, `""` for the whole body.
    pub pointer: String,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Keep only the first `limit` elements of an array.
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestStep {
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Body>,
    #[serde(default)]
    pub auth: Option<Auth>,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub checks: Vec<Check>,
    #[serde(default)]
    pub trend: Option<String>,
    #[serde(default)]
    pub rate: Option<RateSpec>,
    /// Statuses the rest of the iteration depends on.
    #[serde(default)]
    pub require_status: Option<Vec<u16>>,
    /// End the iteration when any of this step's checks failed.
    #[serde(default)]
    pub require_checks: bool,
    #[serde(default)]
    pub extract: Vec<Extraction>,
}

fn default_follow_redirects() -> bool {
    true
}

impl RequestStep {
    pub fn new(name: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            url: url.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            auth: None,
            follow_redirects: true,
            timeout: None,
            checks: Vec::new(),
            trend: None,
            rate: None,
            require_status: None,
            require_checks: false,
            extract: Vec::new(),
        }
    }

    pub fn get(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, HttpMethod::GET, url)
    }

    pub fn post(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, HttpMethod::POST, url)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn form(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.body = Some(Body::Form(fields));
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn trend(mut self, name: impl Into<String>) -> Self {
        self.trend = Some(name.into());
        self
    }

    pub fn rate(mut self, name: impl Into<String>) -> Self {
        self.rate = Some(RateSpec {
            name: name.into(),
            failed_unless_status: None,
        });
        self
    }

    pub fn rate_on_status(mut self, name: impl Into<String>, ok_statuses: Vec<u16>) -> Self {
        self.rate = Some(RateSpec {
            name: name.into(),
            failed_unless_status: Some(ok_statuses),
        });
        self
    }

    pub fn require_status(mut self, statuses: Vec<u16>) -> Self {
        self.require_status = Some(statuses);
        self
    }

    pub fn require_checks(mut self) -> Self {
        self.require_checks = true;
        self
    }

    pub fn extract(mut self, var: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.extract.push(Extraction {
            var: var.into(),
            pointer: pointer.into(),
            required: true,
            limit: None,
        });
        self
    }

    fn render(&self, vars: &Vars, target: &str, default_timeout: Option<Duration>) -> HttpRequest {
        let url = render_str(&self.url, vars);
        let url = if url.starts_with('/') {
            format!("{}{}", target, url)
        } else {
            url
        };

        let body = self.body.as_ref().map(|body| match body {
            Body::Json(value) => Body::Json(render_value(value, vars)),
            Body::Form(fields) => Body::Form(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), render_value(v, vars)))
                    .collect(),
            ),
            Body::Xml(xml) => Body::Xml(render_str(xml, vars)),
        });

        HttpRequest {
            name: self.name.clone(),
            method: self.method,
            url,
            query: self
                .query
                .iter()
                .map(|(k, v)| (k.clone(), render_str(v, vars)))
                .collect(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), render_str(v, vars)))
                .collect(),
            body,
            auth: self.auth.clone(),
            follow_redirects: self.follow_redirects,
            timeout: self.timeout.or(default_timeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    /// Base URL without trailing slash; step urls starting with `/` are
    /// resolved against it.
    pub target: String,
    pub login: Option<LoginConfig>,
    pub steps: Vec<Step>,
    pub pacing: Pacing,
    pub default_timeout: Option<Duration>,
    /// Keep each virtual user's cookies across iterations. Otherwise the jar
    /// is emptied before every iteration.
    pub no_cookies_reset: bool,
}

impl Scenario {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into().trim_end_matches('/').to_string(),
            login: None,
            steps: Vec::new(),
            pacing: Pacing::default(),
            default_timeout: None,
            no_cookies_reset: false,
        }
    }

    pub fn with_login(mut self, login: LoginConfig) -> Self {
        self.login = Some(login);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn request(self, step: RequestStep) -> Self {
        self.step(Step::Request(step))
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn keep_cookies(mut self) -> Self {
        self.no_cookies_reset = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::EmptyScenario);
        }
        let needs_login = self.steps.iter().any(|s| matches!(s, Step::Login));
        // a session that outlives its cookies would send every later step unauthenticated
        if needs_login && !self.no_cookies_reset {
            return Err(ConfigError::LoginNeedsCookies);
        }
        match &self.login {
            None if needs_login => Err(ConfigError::MissingLogin),
            Some(login) if login.user_pool_size == 0 => Err(ConfigError::EmptyUserPool),
            _ => Ok(()),
        }
    }
}

/// How an iteration that did not hit a login failure ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    /// A precondition for the remaining steps did not hold.
    EndedEarly { step: String, reason: String },
}

/// Iteration variables available to `{{name}}` placeholders.
#[derive(Debug, Default, Clone)]
pub struct Vars {
    values: HashMap<String, Value>,
}

impl Vars {
    fn for_iteration(vu: &VirtualUser, scenario: &Scenario) -> Self {
        let mut vars = Self::default();
        vars.set("vu", Value::from(vu.id.0));
        vars.set("iter", Value::from(vu.iterations));
        vars.set("base_url", Value::from(scenario.target.as_str()));
        vars.set("timestamp_ms", Value::from(chrono::Utc::now().timestamp_millis()));
        if let Some(login) = &scenario.login {
            // pooled credentials, usable by plans that post the login form themselves
            vars.set("username", Value::from(login.username_for(vu.id)));
            vars.set("password", Value::from(login.password.as_str()));
        }
        if let Some(username) = vu.session.username() {
            vars.set("username", Value::from(username));
        }
        vars
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitutes `{{name}}` placeholders; unknown names are left untouched.
pub fn render_str(template: &str, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                match vars.get(name) {
                    Some(value) => out.push_str(&value_to_text(value)),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// JSON aware rendering: a string that is exactly one placeholder takes the
/// variable's JSON value, so ids stay numbers and id lists stay arrays.
pub fn render_value(value: &Value, vars: &Vars) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(name) = trimmed
                .strip_prefix("{{")
                .and_then(|r| r.strip_suffix("}}"))
                .filter(|n| !n.contains("{{") && !n.contains("}}"))
            {
                if let Some(found) = vars.get(name.trim()) {
                    return found.clone();
                }
            }
            Value::String(render_str(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn apply_limit(value: &Value, limit: Option<usize>) -> Value {
    match (value, limit) {
        (Value::Array(items), Some(limit)) => Value::Array(items.iter().take(limit).cloned().collect()),
        _ => value.clone(),
    }
}

fn random_up_to(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::thread_rng().gen_range(0.0..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

fn body_preview(record: &RequestRecord) -> String {
    record.text().chars().take(200).collect()
}

/// Runs iterations of one scenario for any number of virtual users.
#[derive(Clone)]
pub struct ScenarioExecutor {
    scenario: Arc<Scenario>,
    transport: Arc<dyn Transport>,
    collector: MetricsCollector,
}

impl ScenarioExecutor {
    pub fn new(scenario: Arc<Scenario>, transport: Arc<dyn Transport>, collector: MetricsCollector) -> Self {
        Self {
            scenario,
            transport,
            collector,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Random delay before an iteration; spreads out workers that start
    /// at the same instant.
    pub async fn start_jitter(&self) {
        if let Some(max) = self.scenario.pacing.start_jitter {
            sleep(random_up_to(max)).await;
        }
    }

    pub fn think_time(&self) -> Duration {
        self.scenario.pacing.think_time
    }

    /// One full pass over the steps, plus iteration level metrics.
    pub async fn run_iteration(&self, vu: &mut VirtualUser) -> Result<IterationOutcome, IterationError> {
        if !self.scenario.no_cookies_reset {
            self.transport.reset_iteration(vu.id);
        }
        let started = Instant::now();
        let result = self.run_steps(vu).await;

        vu.iterations += 1;
        self.collector.add_count(ITERATIONS, 1);
        self.collector
            .record_duration(ITERATION_DURATION, started.elapsed().as_secs_f64() * 1000.0);
        match &result {
            Ok(IterationOutcome::Completed) => {}
            Ok(IterationOutcome::EndedEarly { .. }) => self.collector.add_count(ITERATIONS_ENDED_EARLY, 1),
            Err(IterationError::LoginFailed { .. }) => self.collector.add_count(ITERATIONS_LOGIN_FAILED, 1),
        }

        result
    }

    async fn run_steps(&self, vu: &mut VirtualUser) -> Result<IterationOutcome, IterationError> {
        let scenario = &self.scenario;
        let mut vars = Vars::for_iteration(vu, scenario);

        for step in &scenario.steps {
            match step {
                Step::Login => {
                    // validate() rejects login steps without a login config
                    let Some(login) = &scenario.login else { continue };
                    ensure_logged_in(
                        &mut vu.session,
                        vu.id,
                        &scenario.target,
                        login,
                        self.transport.as_ref(),
                        &self.collector,
                    )
                    .await?;
                    if let Some(username) = vu.session.username() {
                        vars.set("username", Value::from(username));
                    }
                }
                Step::Sleep { duration, max } => {
                    let pause = match max {
                        Some(max) if max > duration => *duration + random_up_to(*max - *duration),
                        _ => *duration,
                    };
                    sleep(pause).await;
                }
                Step::Request(request_step) => {
                    if let Some(outcome) = self.run_request(vu, request_step, &mut vars).await {
                        return Ok(outcome);
                    }
                }
            }
        }

        Ok(IterationOutcome::Completed)
    }

    /// Sends one request step; `Some` means the iteration must stop here.
    async fn run_request(
        &self,
        vu: &VirtualUser,
        step: &RequestStep,
        vars: &mut Vars,
    ) -> Option<IterationOutcome> {
        let request = step.render(vars, &self.scenario.target, self.scenario.default_timeout);
        let record = self.transport.send(vu.id, request).await;
        let status = record.status();

        self.collector.record_request(&record);

        let results = evaluate_checks(&record, &step.checks);
        for result in &results {
            self.collector.record_check(&result.name, result.passed);
        }

        if let Some(trend) = &step.trend {
            self.collector.record_duration(trend, record.duration_ms());
        }
        if let Some(rate) = &step.rate {
            let failed = match &rate.failed_unless_status {
                Some(ok) => !ok.contains(&status),
                None => !all_passed(&results),
            };
            self.collector.record_boolean(&rate.name, failed);
        }

        if let Some(expected) = &step.require_status {
            if !expected.contains(&status) {
                tracing::warn!(
                    vu = %vu.id,
                    step = %step.name,
                    status,
                    error = record.error().unwrap_or_default(),
                    body = %body_preview(&record),
                    "{} failed, ending iteration",
                    step.name
                );
                return Some(IterationOutcome::EndedEarly {
                    step: step.name.clone(),
                    reason: format!("status={}", status),
                });
            }
        }

        if step.require_checks && !all_passed(&results) {
            let failed: Vec<&str> = results.iter().filter(|r| !r.passed).map(|r| r.name.as_str()).collect();
            tracing::warn!(
                vu = %vu.id,
                step = %step.name,
                status,
                failed = ?failed,
                "{} checks failed, ending iteration",
                step.name
            );
            return Some(IterationOutcome::EndedEarly {
                step: step.name.clone(),
                reason: format!("failed checks: {}", failed.join(", ")),
            });
        }

        for extraction in &step.extract {
            match record.json_pointer(&extraction.pointer) {
                Some(value) if !value.is_null() => {
                    vars.set(extraction.var.clone(), apply_limit(value, extraction.limit));
                }
                _ if extraction.required => {
                    tracing::warn!(
                        vu = %vu.id,
                        step = %step.name,
                        pointer = %extraction.pointer,
                        body = %body_preview(&record),
                        "{} response has no usable {}, ending iteration",
                        step.name,
                        extraction.var
                    );
                    return Some(IterationOutcome::EndedEarly {
                        step: step.name.clone(),
                        reason: format!("missing {}", extraction.var),
                    });
                }
                _ => {}
            }
        }

        None
    }
}
