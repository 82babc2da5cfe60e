use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::metrics::thresholds::{self, Threshold};
use crate::scenario::{Pacing, Scenario, Step};
use crate::scheduler::LoadSchedule;
use crate::session::LoginConfig;
use crate::utils::duration;

/// A complete load test as submitted to the worker: where to send traffic,
/// how to ramp virtual users, what each of them does per iteration and
/// which criteria decide pass/fail.
#[derive(Debug, Deserialize, Clone)]
pub struct RunPlan {
    pub name: String,
    pub target: String,
    pub executor: LoadSchedule,

    #[serde(default = "default_graceful_ramp_down", with = "duration")]
    pub graceful_ramp_down: Duration,

    #[serde(default)]
    pub login: Option<LoginConfig>,

    #[serde(default)]
    pub pacing: Pacing,

    /// Keep cookies across iterations. Required by plans with a login step.
    #[serde(default)]
    pub no_cookies_reset: bool,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,

    /// Per-request timeout applied when a step does not set its own.
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
}

fn default_graceful_ramp_down() -> Duration {
    Duration::from_secs(30)
}

/// Process level settings that take precedence over the plan file.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub base_url: Option<String>,
    pub user_count: Option<u64>,
    pub password: Option<String>,
}

impl RunPlan {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Plan(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Plan(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn apply_overrides(&mut self, overrides: &PlanOverrides) {
        if let Some(base_url) = &overrides.base_url {
            self.target = base_url.clone();
        }
        if let Some(login) = self.login.as_mut() {
            if let Some(count) = overrides.user_count {
                login.user_pool_size = count;
            }
            if let Some(password) = &overrides.password {
                login.password = password.clone();
            }
        }
    }

    /// Checks everything that can be checked before traffic starts and
    /// returns the parsed thresholds.
    pub fn validate(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.executor.validate()?;

        url::Url::parse(&self.target).map_err(|_| ConfigError::InvalidTarget(self.target.clone()))?;

        self.scenario().validate()?;

        thresholds::parse_all(&self.thresholds)
    }

    pub fn scenario(&self) -> Scenario {
        Scenario {
            name: self.name.clone(),
            target: self.target.trim_end_matches('/').to_string(),
            login: self.login.clone(),
            steps: self.steps.clone(),
            pacing: self.pacing.clone(),
            default_timeout: self.timeout,
            no_cookies_reset: self.no_cookies_reset,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", content = "content")]
pub enum Body {
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded`; array values repeat the key.
    Form(BTreeMap<String, serde_json::Value>),
    Xml(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", content = "credentials")]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    ApiKey {
        key_name: String,
        key_value: String,
        #[serde(default = "default_in_header")]
        in_header: bool,
    },
}

fn default_in_header() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Stage;

    const ORDER_PLAN: &str = r#"{
        "name": "order_1k",
        "target": "http://localhost:8080/",
        "executor": {
            "executor": "ramping-vus",
            "start_vus": 0,
            "stages": [
                { "duration": "30s", "target": 100 },
                { "duration": "60s", "target": 1000 },
                { "duration": "30s", "target": 0 }
            ]
        },
        "graceful_ramp_down": "30s",
        "no_cookies_reset": true,
        "login": { "user_pool_size": 1000 },
        "steps": [
            { "type": "login" },
            {
                "type": "request",
                "name": "pay_prepare",
                "method": "POST",
                "url": "/pay/prepare",
                "follow_redirects": false,
                "body": { "type": "Form", "content": { "orderType": "BUY_NOW", "productId": "1", "quantity": "1" } },
                "checks": [ { "name": "prepare 200", "status_in": [200] } ],
                "trend": "prepare_duration",
                "rate": { "name": "pay_prepare_fail" },
                "require_status": [200],
                "extract": [ { "var": "orderId", "pointer": "/orderId" }, { "var": "amount", "pointer": "/amount" } ]
            }
        ],
        "thresholds": { "http_req_failed": ["rate<0.01"] }
    }"#;

    #[test]
    fn test_parse_plan() {
        let plan = RunPlan::from_json(ORDER_PLAN).unwrap();
        assert_eq!(plan.name, "order_1k");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.graceful_ramp_down, Duration::from_secs(30));
        match &plan.executor {
            LoadSchedule::RampingVus(ramp) => {
                assert_eq!(ramp.stages[1], Stage::new(Duration::from_secs(60), 1000))
            }
            other => panic!("unexpected executor {:?}", other),
        }

        let thresholds = plan.validate().unwrap();
        assert_eq!(thresholds.len(), 1);
        assert_eq!(plan.scenario().target, "http://localhost:8080");
    }

    #[test]
    fn test_overrides() {
        let mut plan = RunPlan::from_json(ORDER_PLAN).unwrap();
        plan.apply_overrides(&PlanOverrides {
            base_url: Some("https://shop.example".to_string()),
            user_count: Some(400),
            password: Some("s3cret".to_string()),
        });
        assert_eq!(plan.target, "https://shop.example");
        let login = plan.login.unwrap();
        assert_eq!(login.user_pool_size, 400);
        assert_eq!(login.password, "s3cret");
    }

    #[test]
    fn test_login_step_without_login_config() {
        let mut plan = RunPlan::from_json(ORDER_PLAN).unwrap();
        plan.login = None;
        assert_eq!(plan.validate().unwrap_err(), ConfigError::MissingLogin);
    }

    #[test]
    fn test_login_step_with_cookie_reset() {
        let mut plan = RunPlan::from_json(ORDER_PLAN).unwrap();
        assert!(plan.scenario().no_cookies_reset);
        plan.no_cookies_reset = false;
        assert_eq!(plan.validate().unwrap_err(), ConfigError::LoginNeedsCookies);
    }

    #[test]
    fn test_bad_target() {
        let mut plan = RunPlan::from_json(ORDER_PLAN).unwrap();
        plan.target = "not a url".to_string();
        assert!(matches!(plan.validate(), Err(ConfigError::InvalidTarget(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(RunPlan::from_json("{"), Err(ConfigError::Plan(_))));
    }
}
