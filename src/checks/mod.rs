//! Named boolean assertions over a `RequestRecord`.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::client::RequestRecord;

pub type Predicate = Arc<dyn Fn(&RequestRecord) -> bool + Send + Sync>;

/// A named, side-effect free predicate.
#[derive(Clone, Deserialize)]
#[serde(from = "CheckSpec")]
pub struct Check {
    pub name: String,
    predicate: Predicate,
}

impl Check {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&RequestRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn status(name: impl Into<String>, expected: u16) -> Self {
        Self::new(name, move |r| r.status() == expected)
    }

    pub fn passes(&self, record: &RequestRecord) -> bool {
        (self.predicate)(record)
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// Runs every check against the record. No short-circuit: a failing check
/// never hides the outcome of the ones after it.
pub fn evaluate_checks(record: &RequestRecord, checks: &[Check]) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| CheckResult {
            name: check.name.clone(),
            passed: check.passes(record),
        })
        .collect()
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Declarative form of a check used in plan files.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    #[serde(flatten)]
    pub rule: CheckRule,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRule {
    StatusIn(Vec<u16>),
    HeaderContains { header: String, value: String },
    /// Passes when the header is absent or does not contain `value`.
    HeaderLacks { header: String, value: String },
    BodyContains(String),
    /// JSON pointer that must resolve to a non-null value.
    JsonPresent(String),
    DurationBelowMs(f64),
}

impl CheckRule {
    pub fn matches(&self, record: &RequestRecord) -> bool {
        match self {
            Self::StatusIn(statuses) => statuses.contains(&record.status()),
            Self::HeaderContains { header, value } => {
                record.header(header).is_some_and(|h| h.contains(value.as_str()))
            }
            Self::HeaderLacks { header, value } => {
                !record.header(header).is_some_and(|h| h.contains(value.as_str()))
            }
            Self::BodyContains(needle) => record.text().contains(needle.as_str()),
            Self::JsonPresent(pointer) => record.json_pointer(pointer).is_some_and(|v| !v.is_null()),
            Self::DurationBelowMs(limit) => record.duration_ms() < *limit,
        }
    }
}

impl From<CheckSpec> for Check {
    fn from(spec: CheckSpec) -> Self {
        let rule = spec.rule;
        Check::new(spec.name, move |record| rule.matches(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_evaluates_all_predicates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = |name: &str, result: bool| {
            let calls = Arc::clone(&calls);
            Check::new(name, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                result
            })
        };

        let checks = vec![counted("first", false), counted("second", true), counted("third", false)];
        let results = evaluate_checks(&RequestRecord::status_only(500), &checks);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            results,
            vec![
                CheckResult { name: "first".into(), passed: false },
                CheckResult { name: "second".into(), passed: true },
                CheckResult { name: "third".into(), passed: false },
            ]
        );
        assert!(!all_passed(&results));
    }

    #[test]
    fn test_session_cookie_check() {
        let check = Check::from(CheckSpec {
            name: "session cookie set".into(),
            rule: CheckRule::HeaderContains {
                header: "Set-Cookie".into(),
                value: "JSESSIONID".into(),
            },
        });
        let with_cookie = RequestRecord::status_only(302).with_header("set-cookie", "JSESSIONID=1; Path=/");
        assert!(check.passes(&with_cookie));
        assert!(!check.passes(&RequestRecord::status_only(302)));
    }

    #[test]
    fn test_rules() {
        let record = RequestRecord::status_only(200)
            .with_json(&json!({ "orderId": "A-1", "amount": null }))
            .with_duration(Duration::from_millis(120));

        assert!(CheckRule::StatusIn(vec![200, 302]).matches(&record));
        assert!(CheckRule::JsonPresent("/orderId".into()).matches(&record));
        assert!(!CheckRule::JsonPresent("/amount".into()).matches(&record));
        assert!(CheckRule::BodyContains("A-1".into()).matches(&record));
        assert!(CheckRule::DurationBelowMs(500.0).matches(&record));
        assert!(!CheckRule::DurationBelowMs(100.0).matches(&record));
        assert!(CheckRule::HeaderLacks { header: "Location".into(), value: "error".into() }.matches(&record));
    }

    #[test]
    fn test_checks_from_plan_json() {
        let checks: Vec<Check> = serde_json::from_value(json!([
            { "name": "confirm 200", "status_in": [200] },
            { "name": "fast", "duration_below_ms": 1000.0 },
            { "name": "no error redirect", "header_lacks": { "header": "Location", "value": "error" } }
        ]))
        .unwrap();
        assert_eq!(checks.len(), 3);
        let results = evaluate_checks(&RequestRecord::status_only(200), &checks);
        assert!(all_passed(&results));
    }
}
