//! Virtual users, their session state and the one-time login step.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{HttpRequest, RequestRecord, Transport};
use crate::error::IterationError;
use crate::metrics::collector::MetricsCollector;
use crate::models::dsl_model::{Body, HttpMethod};

/// Virtual user id, 1-based, unique among concurrently running workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VuId(pub u64);

impl fmt::Display for VuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-VU session. The transport keeps the cookie jar under `jar`; this
/// record only tracks whether the jar holds an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    logged_in: bool,
    username: Option<String>,
    jar: VuId,
}

impl SessionState {
    pub fn new(jar: VuId) -> Self {
        Self {
            logged_in: false,
            username: None,
            jar,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn jar(&self) -> VuId {
        self.jar
    }

    fn mark_logged_in(&mut self, username: String) {
        self.logged_in = true;
        self.username = Some(username);
    }
}

/// One simulated client. Owned by exactly one worker task.
#[derive(Debug)]
pub struct VirtualUser {
    pub id: VuId,
    pub session: SessionState,
    pub iterations: u64,
}

impl VirtualUser {
    pub fn new(id: VuId) -> Self {
        Self {
            id,
            session: SessionState::new(id),
            iterations: 0,
        }
    }
}

/// How a virtual user authenticates. Defaults follow the form login of the
/// shop under test (`POST /login`, `user0..user999`, redirect on success).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub user_pool_size: u64,
    #[serde(default = "default_prefix")]
    pub username_prefix: String,
    /// First username suffix; `0` yields `user0`, `1` yields `user1`.
    #[serde(default)]
    pub index_base: u64,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<u16>,
    /// Substring of `Location` that turns a 302 into a failure.
    #[serde(default = "default_error_marker")]
    pub error_marker: String,
    #[serde(default = "default_trend")]
    pub trend: String,
    #[serde(default = "default_rate")]
    pub rate: String,
    #[serde(default = "default_check")]
    pub check: String,
}

fn default_path() -> String {
    "/login".to_string()
}
fn default_pool_size() -> u64 {
    1000
}
fn default_prefix() -> String {
    "user".to_string()
}
fn default_password() -> String {
    "password!".to_string()
}
fn default_username_field() -> String {
    "username".to_string()
}
fn default_password_field() -> String {
    "password".to_string()
}
fn default_success_statuses() -> Vec<u16> {
    vec![200]
}
fn default_error_marker() -> String {
    "error".to_string()
}
fn default_trend() -> String {
    "login_duration".to_string()
}
fn default_rate() -> String {
    "login_fail".to_string()
}
fn default_check() -> String {
    "login ok (200/302)".to_string()
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            user_pool_size: default_pool_size(),
            username_prefix: default_prefix(),
            index_base: 0,
            password: default_password(),
            username_field: default_username_field(),
            password_field: default_password_field(),
            success_statuses: default_success_statuses(),
            error_marker: default_error_marker(),
            trend: default_trend(),
            rate: default_rate(),
            check: default_check(),
        }
    }
}

impl LoginConfig {
    /// Credential pool is reused cyclically: VU `n` maps to slot
    /// `(n - 1) % pool`.
    pub fn username_for(&self, vu: VuId) -> String {
        let pool = self.user_pool_size.max(1);
        let slot = vu.0.saturating_sub(1) % pool;
        format!("{}{}", self.username_prefix, slot + self.index_base)
    }

    /// 200 (or any configured success status) or a 302 whose `Location`
    /// does not point at an error page.
    pub fn accepts(&self, record: &RequestRecord) -> bool {
        if self.success_statuses.contains(&record.status()) {
            return true;
        }
        record.status() == 302
            && !record
                .header("Location")
                .unwrap_or_default()
                .contains(self.error_marker.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    AlreadyLoggedIn,
    LoggedIn,
}

/// Logs the virtual user in unless its session already is. Failure leaves
/// the session logged out so the next iteration tries again.
pub async fn ensure_logged_in(
    session: &mut SessionState,
    vu: VuId,
    target: &str,
    login: &LoginConfig,
    transport: &dyn Transport,
    collector: &MetricsCollector,
) -> Result<LoginOutcome, IterationError> {
    if session.logged_in {
        return Ok(LoginOutcome::AlreadyLoggedIn);
    }

    let username = login.username_for(vu);

    let mut form: BTreeMap<String, Value> = BTreeMap::new();
    form.insert(login.username_field.clone(), Value::String(username.clone()));
    form.insert(login.password_field.clone(), Value::String(login.password.clone()));

    let mut request = HttpRequest::new("login", HttpMethod::POST, format!("{}{}", target, login.path));
    request.body = Some(Body::Form(form));
    request.follow_redirects = false;

    let record = transport.send(session.jar, request).await;
    let location = record.header("Location").unwrap_or_default().to_string();
    let ok = login.accepts(&record);

    collector.record_request(&record);
    collector.record_check(&login.check, ok);
    collector.record_duration(&login.trend, record.duration_ms());
    collector.record_boolean(&login.rate, !ok);

    if !ok {
        return Err(IterationError::LoginFailed {
            username,
            status: record.status(),
            location,
        });
    }

    tracing::debug!(vu = %vu, username = %username, cookies = ?transport.cookies(session.jar), "logged in");
    session.mark_logged_in(username);
    Ok(LoginOutcome::LoggedIn)
}
