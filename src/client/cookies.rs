//! Per virtual user cookie storage.
//!
//! Every VU talks to a single target, so cookies are kept per VU by name only;
//! domain and path attributes are not tracked. `Max-Age=0` and empty values
//! delete the cookie, which is what servers send on session invalidation.

use std::collections::{BTreeMap, HashMap};

use hyper::header::{HeaderMap, HeaderValue, SET_COOKIE};
use parking_lot::Mutex;

use crate::session::VuId;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn store_from(&mut self, headers: &HeaderMap) {
        for raw in headers.get_all(SET_COOKIE) {
            if let Ok(raw) = raw.to_str() {
                self.store(raw);
            }
        }
    }

    pub fn store(&mut self, set_cookie: &str) {
        let mut parts = set_cookie.split(';');
        let Some((name, value)) = parts.next().and_then(|pair| pair.split_once('=')) else {
            return;
        };
        let name = name.trim();
        let value = value.trim().trim_matches('"');
        if name.is_empty() {
            return;
        }

        let expired = parts.any(|attr| {
            let attr = attr.trim().to_ascii_lowercase();
            attr == "max-age=0" || attr.starts_with("max-age=-")
        });

        if expired || value.is_empty() {
            self.cookies.remove(name);
        } else {
            self.cookies.insert(name.to_string(), value.to_string());
        }
    }

    /// Value for an outgoing `Cookie` header, `None` when the jar is empty.
    pub fn header_value(&self) -> Option<HeaderValue> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        self.cookies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Jars for all live virtual users, keyed by VU id.
#[derive(Debug, Default)]
pub struct CookieStore {
    jars: Mutex<HashMap<VuId, CookieJar>>,
}

impl CookieStore {
    pub fn header_for(&self, vu: VuId) -> Option<HeaderValue> {
        self.jars.lock().get(&vu).and_then(CookieJar::header_value)
    }

    pub fn absorb(&self, vu: VuId, headers: &HeaderMap) {
        if headers.contains_key(SET_COOKIE) {
            self.jars.lock().entry(vu).or_default().store_from(headers);
        }
    }

    pub fn snapshot(&self, vu: VuId) -> Vec<(String, String)> {
        self.jars
            .lock()
            .get(&vu)
            .map(CookieJar::pairs)
            .unwrap_or_default()
    }

    pub fn clear(&self, vu: VuId) {
        self.jars.lock().remove(&vu);
    }
}
