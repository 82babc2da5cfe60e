pub mod cookies;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE, LOCATION};
use hyper::{Body as HyperBody, Client, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::Url;

use crate::client::cookies::CookieStore;
use crate::error::TransportError;
use crate::models::dsl_model::{Auth, Body, HttpMethod};
use crate::session::VuId;

pub type HttpsClient = Client<HttpsConnector<hyper::client::HttpConnector>>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_REDIRECTS: usize = 10;

/// Everything needed to issue one request, after templating.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    pub auth: Option<Auth>,
    pub follow_redirects: bool,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(name: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            url: url.into(),
            follow_redirects: true,
            ..Default::default()
        }
    }
}

/// Outcome of one HTTP action. Transport failures carry status 0 and an
/// error message instead of a response.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    duration: Duration,
    error: Option<String>,
    json: OnceLock<Option<Value>>,
}

impl RequestRecord {
    pub fn new(status: u16, headers: HeaderMap, body: Bytes, duration: Duration) -> Self {
        Self {
            status,
            headers,
            body,
            duration,
            error: None,
            json: OnceLock::new(),
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            duration,
            error: Some(error.into()),
            json: OnceLock::new(),
        }
    }

    /// Shorthand for canned responses.
    pub fn status_only(status: u16) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new(), Duration::ZERO)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.json = OnceLock::new();
        self
    }

    pub fn with_json(self, value: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Case-insensitive header lookup; the first value wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body decoded as JSON on first access. `None` when it does not parse.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    /// RFC 6901 pointer into the JSON body; `""` is the whole document.
    pub fn json_pointer(&self, pointer: &str) -> Option<&Value> {
        self.json().and_then(|v| v.pointer(pointer))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_transport_error(&self) -> bool {
        self.error.is_some()
    }

    /// Failure as counted by `http_req_failed`.
    pub fn is_failed(&self) -> bool {
        self.is_transport_error() || self.status >= 400
    }
}

/// Black-box HTTP collaborator. Implementations must never panic or return
/// early on network errors: failures become a `RequestRecord`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, vu: VuId, request: HttpRequest) -> RequestRecord;

    /// Cookies currently held for `vu`.
    fn cookies(&self, _vu: VuId) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Called before each iteration unless the scenario keeps cookies.
    fn reset_iteration(&self, _vu: VuId) {}

    /// Called when the virtual user is torn down.
    fn release(&self, _vu: VuId) {}
}

pub struct HyperTransport {
    client: HttpsClient,
    cookies: CookieStore,
    default_timeout: Duration,
}

impl HyperTransport {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        let https = HttpsConnector::new();
        let client: HttpsClient = Client::builder().build::<_, hyper::Body>(https);
        Self {
            client,
            cookies: CookieStore::default(),
            default_timeout: default_timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }

    async fn execute(
        &self,
        vu: VuId,
        request: &HttpRequest,
    ) -> Result<(StatusCode, HeaderMap, Bytes), TransportError> {
        let mut url = build_url(request)?;
        let mut method = to_hyper_method(request.method);
        let (mut content_type, mut payload) = encode_body(request.body.as_ref())?;

        for _ in 0..=MAX_REDIRECTS {
            let mut req_builder = Request::builder().method(method.clone()).uri(url.as_str());

            if let Some(content_type) = content_type {
                req_builder = req_builder.header(CONTENT_TYPE, content_type);
            }
            for (name, value) in &request.headers {
                req_builder = req_builder.header(name.as_str(), value.as_str());
            }
            if let Some(auth) = &request.auth {
                match auth {
                    Auth::Basic { username, password } => {
                        let encoded = BASE64.encode(format!("{}:{}", username, password));
                        req_builder = req_builder.header(AUTHORIZATION, format!("Basic {}", encoded));
                    }
                    Auth::Bearer { token } => {
                        req_builder = req_builder.header(AUTHORIZATION, format!("Bearer {}", token));
                    }
                    Auth::ApiKey { key_name, key_value, in_header: true } => {
                        req_builder = req_builder.header(key_name.as_str(), key_value.as_str());
                    }
                    // query string variant is applied in build_url
                    Auth::ApiKey { in_header: false, .. } => {}
                    Auth::None => {}
                }
            }
            if let Some(cookie) = self.cookies.header_for(vu) {
                req_builder = req_builder.header(COOKIE, cookie);
            }

            let body = match &payload {
                Some(bytes) => HyperBody::from(bytes.clone()),
                None => HyperBody::empty(),
            };
            let hyper_request = req_builder
                .body(body)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

            let response = self.client.request(hyper_request).await.map_err(classify)?;
            self.cookies.absorb(vu, response.headers());

            let status = response.status();
            if request.follow_redirects && status.is_redirection() {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| url.join(loc).ok());

                if let Some(next) = next {
                    tracing::trace!(from = %url, to = %next, status = status.as_u16(), "following redirect");
                    let rewrite_to_get = status == StatusCode::SEE_OTHER
                        || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                            && method != Method::GET
                            && method != Method::HEAD);
                    if rewrite_to_get {
                        method = Method::GET;
                        payload = None;
                        content_type = None;
                    }
                    url = next;
                    continue;
                }
            }

            let (parts, body) = response.into_parts();
            let bytes = hyper::body::to_bytes(body).await.map_err(classify)?;
            return Ok((parts.status, parts.headers, bytes));
        }

        Err(TransportError::TooManyRedirects(MAX_REDIRECTS))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, vu: VuId, request: HttpRequest) -> RequestRecord {
        let max_request_duration = request.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        let result = timeout(max_request_duration, self.execute(vu, &request)).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok((status, headers, body))) => {
                tracing::debug!(vu = %vu, name = %request.name, status = status.as_u16(), ms = elapsed.as_millis() as u64, "response");
                RequestRecord::new(status.as_u16(), headers, body, elapsed)
            }
            Ok(Err(e)) => {
                tracing::debug!(vu = %vu, name = %request.name, error = %e, "request error");
                RequestRecord::failed(e.to_string(), elapsed)
            }
            Err(_) => {
                tracing::debug!(vu = %vu, name = %request.name, "request timed out");
                RequestRecord::failed(TransportError::Timeout.to_string(), elapsed)
            }
        }
    }

    fn cookies(&self, vu: VuId) -> Vec<(String, String)> {
        self.cookies.snapshot(vu)
    }

    fn reset_iteration(&self, vu: VuId) {
        self.cookies.clear(vu);
    }

    fn release(&self, vu: VuId) {
        self.cookies.clear(vu);
    }
}

fn to_hyper_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::GET => Method::GET,
        HttpMethod::POST => Method::POST,
        HttpMethod::PUT => Method::PUT,
        HttpMethod::DELETE => Method::DELETE,
        HttpMethod::PATCH => Method::PATCH,
        HttpMethod::HEAD => Method::HEAD,
        HttpMethod::OPTIONS => Method::OPTIONS,
    }
}

fn build_url(request: &HttpRequest) -> Result<Url, TransportError> {
    let mut url = Url::parse(&request.url)
        .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", request.url, e)))?;

    let api_key = match &request.auth {
        Some(Auth::ApiKey { key_name, key_value, in_header: false }) => Some((key_name, key_value)),
        _ => None,
    };

    if !request.query.is_empty() || api_key.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.query {
            pairs.append_pair(key, value);
        }
        if let Some((key, value)) = api_key {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}

/// Content type and bytes for a request body.
pub fn encode_body(body: Option<&Body>) -> Result<(Option<&'static str>, Option<Bytes>), TransportError> {
    match body {
        Some(Body::Json(json)) => {
            let json_string =
                serde_json::to_string(json).map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            Ok((Some("application/json"), Some(Bytes::from(json_string))))
        }
        Some(Body::Form(fields)) => {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in fields {
                match value {
                    Value::Array(items) => {
                        for item in items {
                            form.append_pair(key, &scalar_to_string(item));
                        }
                    }
                    other => {
                        form.append_pair(key, &scalar_to_string(other));
                    }
                }
            }
            Ok((Some("application/x-www-form-urlencoded"), Some(Bytes::from(form.finish()))))
        }
        Some(Body::Xml(xml)) => Ok((Some("application/xml"), Some(Bytes::from(xml.clone())))),
        None => Ok((None, None)),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn classify(e: hyper::Error) -> TransportError {
    if e.is_connect() {
        TransportError::Connect
    } else if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_closed() || e.is_incomplete_message() {
        TransportError::Closed
    } else {
        TransportError::Other(e.to_string())
    }
}
