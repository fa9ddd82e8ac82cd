//! Protected outbound calls to named downstream services.
//!
//! [`ConnectivityManager::execute`] wraps every attempt against a registered
//! service in its circuit breaker and retry policy:
//!
//! ```text
//!  execute(service, request)
//!     |
//!     v
//!  +-----------------+   open
//!  | try_acquire     | --------> Error::CircuitOpen (no I/O)
//!  +-----------------+
//!     |
//!     v
//!  +-----------------+   5xx / 429 / transport error / timeout
//!  | send + timeout  | ----------------------+
//!  +-----------------+                       |
//!     | other status                         v
//!     v                              record_result(false)
//!  record_result(true)               sleep next_delay(attempt)
//!  return response                   loop (up to max_attempts)
//!                                            |
//!                                            v
//!                                    Error::Connectivity
//! ```
//!
//! The wire is behind the [`Transport`] trait. [`HttpTransport`] is the
//! reqwest implementation used for services registered from configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::constants::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::retry::{RetryPolicy, Scheduler};
use crate::{bail_if, Error, Result};

// =============================================================================
// SERVICE CONFIGURATION
// =============================================================================

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Connect and per-attempt timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTimeouts {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServiceTimeouts {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A downstream service. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service id used in `execute` calls.
    pub service_id: String,

    /// Base URL, e.g. `https://billing.internal:8443`.
    pub base_address: String,

    #[serde(default)]
    pub timeouts: ServiceTimeouts,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Headers sent with every request to this service.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// A service with default timeouts, retry and breaker settings.
    pub fn new(service_id: impl Into<String>, base_address: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            base_address: base_address.into(),
            timeouts: ServiceTimeouts::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            default_headers: BTreeMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServiceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        bail_if!(
            self.service_id.trim().is_empty(),
            Error::config_invalid_value("services.service_id", "must not be empty")
        );
        let id = &self.service_id;
        bail_if!(
            !(self.base_address.starts_with("http://") || self.base_address.starts_with("https://")),
            Error::config_invalid_value(
                format!("services.{id}.base_address"),
                format!("'{}' is not an http(s) URL", self.base_address),
            )
        );
        bail_if!(
            self.timeouts.connect_timeout_ms == 0 || self.timeouts.request_timeout_ms == 0,
            Error::config_invalid_value(format!("services.{id}.timeouts"), "must be positive")
        );
        self.retry.validate(id)?;
        self.circuit_breaker.validate(id)?;
        Ok(())
    }
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// HTTP method of a [`ServiceRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An outbound request, relative to the service's base address.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ServiceRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let mut req = Self::new(HttpMethod::Post, path);
        req.body = Some(body.into());
        req
    }

    /// A POST with a JSON body.
    pub fn json<T: Serialize>(path: impl Into<String>, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::post(path, body).with_header("Content-Type", "application/json"))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A downstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ServiceResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Statuses that count as a failed attempt.
pub fn is_failure_status(status: u16) -> bool {
    status >= 500 || status == 429
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Performs one attempt against a service.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, config: &ServiceConfig, request: &ServiceRequest)
        -> Result<ServiceResponse>;
}

/// reqwest-backed transport with the service's timeouts and default headers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client for `config`.
    pub fn for_service(config: &ServiceConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let header_name = HeaderName::from_str(name).map_err(|e| {
                Error::config_invalid_value(
                    format!("services.{}.default_headers", config.service_id),
                    format!("invalid header name '{name}': {e}"),
                )
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::config_invalid_value(
                    format!("services.{}.default_headers.{name}", config.service_id),
                    e.to_string(),
                )
            })?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect_timeout())
            .timeout(config.timeouts.request_timeout())
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }

    fn url(config: &ServiceConfig, path: &str) -> String {
        let base = config.base_address.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        config: &ServiceConfig,
        request: &ServiceRequest,
    ) -> Result<ServiceResponse> {
        let url = Self::url(config, &request.path);
        let mut builder = self.client.request(request.method.into(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(ServiceResponse {
            status,
            headers,
            body,
        })
    }
}

// =============================================================================
// CONNECTIVITY MANAGER
// =============================================================================

/// A registered service and the transport that reaches it.
#[derive(Debug)]
struct ServiceClient {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
}

/// Breaker snapshot for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub service_id: String,
    pub base_address: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

/// Guards outbound calls to registered services.
#[derive(Debug)]
pub struct ConnectivityManager {
    services: DashMap<String, Arc<ServiceClient>>,
    breakers: Arc<CircuitBreakerRegistry>,
    scheduler: Arc<dyn Scheduler>,
}

impl ConnectivityManager {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            services: DashMap::new(),
            breakers,
            scheduler,
        }
    }

    /// Register a service reached over HTTP.
    pub async fn register_service(&self, config: ServiceConfig) -> Result<()> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::for_service(&config)?);
        self.register_service_with_transport(config, transport).await
    }

    /// Register a service reached through a custom transport.
    pub async fn register_service_with_transport(
        &self,
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        config.validate()?;
        bail_if!(
            self.services.contains_key(&config.service_id),
            Error::ServiceAlreadyRegistered {
                service: config.service_id.clone(),
            }
        );
        self.breakers
            .register(&config.service_id, config.circuit_breaker)
            .await?;
        info!(
            service = %config.service_id,
            base_address = %config.base_address,
            max_attempts = config.retry.max_attempts,
            "service registered"
        );
        self.services.insert(
            config.service_id.clone(),
            Arc::new(ServiceClient { config, transport }),
        );
        Ok(())
    }

    /// The breaker registry shared with this manager.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Call `service` with breaker and retry protection.
    pub async fn execute(&self, service: &str, request: ServiceRequest) -> Result<ServiceResponse> {
        self.execute_with(service, request, &CancellationToken::new())
            .await
    }

    /// As [`execute`](Self::execute), failing with [`Error::Timeout`] when
    /// `deadline` elapses first.
    pub async fn execute_with_deadline(
        &self,
        service: &str,
        request: ServiceRequest,
        deadline: Duration,
    ) -> Result<ServiceResponse> {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };

        let result = self.execute_with(service, request, &cancel).await;
        timer.abort();

        match result {
            Err(Error::Cancelled) => Err(Error::Timeout {
                service: service.to_string(),
                timeout_ms: deadline.as_millis() as u64,
            }),
            other => other,
        }
    }

    /// As [`execute`](Self::execute), aborting with [`Error::Cancelled`]
    /// when `cancel` fires.
    pub async fn execute_with(
        &self,
        service: &str,
        request: ServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse> {
        let client = self
            .services
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::service_not_registered(service))?;

        let policy = &client.config.retry;
        let request_timeout = client.config.timeouts.request_timeout();
        let mut attempts = 0;
        let mut last_error = String::new();

        for attempt in 0..policy.max_attempts {
            bail_if!(cancel.is_cancelled(), Error::Cancelled);
            self.breakers.try_acquire(service).await?;
            attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.breakers.release_probe(service).await {
                        warn!(service, "failed to release probe slot: {}", e);
                    }
                    return Err(Error::Cancelled);
                }
                outcome = tokio::time::timeout(
                    request_timeout,
                    client.transport.send(&client.config, &request),
                ) => outcome,
            };

            last_error = match outcome {
                Ok(Ok(response)) if !is_failure_status(response.status) => {
                    self.record(service, true).await;
                    debug!(service, attempt, status = response.status, "call succeeded");
                    return Ok(response);
                }
                Ok(Ok(response)) => format!("HTTP {}", response.status),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", request_timeout.as_millis()),
            };
            self.record(service, false).await;
            debug!(service, attempt, error = %last_error, "attempt failed");

            if attempt + 1 < policy.max_attempts {
                let delay = policy.next_delay(attempt);
                if !self.scheduler.sleep(delay, cancel).await {
                    return Err(Error::Cancelled);
                }
            }
        }

        warn!(service, attempts, error = %last_error, "service unreachable");
        Err(Error::Connectivity {
            service: service.to_string(),
            attempts,
            last_error,
        })
    }

    async fn record(&self, service: &str, success: bool) {
        if let Err(e) = self.breakers.record_result(service, success).await {
            warn!(service, "failed to record breaker result: {}", e);
        }
    }

    /// Breaker snapshot for every registered service, sorted by id.
    pub async fn service_health(&self) -> Vec<ServiceHealth> {
        let clients: Vec<Arc<ServiceClient>> =
            self.services.iter().map(|e| Arc::clone(e.value())).collect();

        let mut health = Vec::with_capacity(clients.len());
        for client in clients {
            let id = &client.config.service_id;
            match self.breakers.state(id).await {
                Ok(state) => health.push(ServiceHealth {
                    service_id: id.clone(),
                    base_address: client.config.base_address.clone(),
                    state: state.state,
                    failure_count: state.failure_count,
                    next_attempt_time: state.next_attempt_time,
                }),
                Err(e) => warn!(service = %id, "breaker state unavailable: {}", e),
            }
        }
        health.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        health
    }

    pub async fn force_open(&self, service: &str) -> Result<()> {
        self.breakers.force_open(service).await
    }

    pub async fn reset(&self, service: &str) -> Result<()> {
        self.breakers.reset(service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditDispatcher;
    use crate::clock::ManualClock;
    use crate::retry::BackoffStrategy;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of statuses.
    #[derive(Debug)]
    struct ScriptedTransport {
        statuses: Mutex<VecDeque<u16>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _: &ServiceConfig, _: &ServiceRequest) -> Result<ServiceResponse> {
            *self.calls.lock().unwrap() += 1;
            let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
            Ok(ServiceResponse::new(status, "ok"))
        }
    }

    /// Records requested delays without sleeping.
    #[derive(Debug, Default)]
    struct RecordingScheduler {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Scheduler for RecordingScheduler {
        async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
            self.delays.lock().unwrap().push(duration);
            !cancel.is_cancelled()
        }
    }

    fn manager(scheduler: Arc<RecordingScheduler>) -> ConnectivityManager {
        let registry = CircuitBreakerRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::starting_now()),
            AuditDispatcher::default(),
        );
        ConnectivityManager::new(Arc::new(registry), scheduler)
    }

    fn service(max_attempts: u32, failure_threshold: u32) -> ServiceConfig {
        ServiceConfig::new("billing", "http://billing.internal")
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(max_attempts)
                    .with_strategy(BackoffStrategy::Linear)
                    .with_delays(Duration::from_millis(100), Duration::from_secs(1))
                    .with_jitter(false),
            )
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            })
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = manager(scheduler.clone());
        let transport = ScriptedTransport::new(&[503, 429, 200]);
        manager
            .register_service_with_transport(service(3, 10), transport.clone())
            .await
            .unwrap();

        let response = manager
            .execute("billing", ServiceRequest::get("/invoices"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            *scheduler.delays.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        let state = manager.breakers().state("billing").await.unwrap();
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = manager(scheduler);
        let transport = ScriptedTransport::new(&[404]);
        manager
            .register_service_with_transport(service(3, 10), transport.clone())
            .await
            .unwrap();

        let response = manager
            .execute("billing", ServiceRequest::get("/missing"))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = manager(scheduler.clone());
        let transport = ScriptedTransport::new(&[500, 502, 503]);
        manager
            .register_service_with_transport(service(3, 10), transport)
            .await
            .unwrap();

        let err = manager
            .execute("billing", ServiceRequest::get("/"))
            .await
            .unwrap_err();
        match err {
            Error::Connectivity {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "HTTP 503");
            }
            other => panic!("unexpected error: {other}"),
        }
        // No sleep after the final attempt.
        assert_eq!(scheduler.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_breaker_opening_mid_loop_stops_retries() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = manager(scheduler);
        let transport = ScriptedTransport::new(&[500, 500, 500, 500]);
        manager
            .register_service_with_transport(service(4, 2), transport.clone())
            .await
            .unwrap();

        let err = manager
            .execute("billing", ServiceRequest::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { failure_count: 2, .. }));
        assert_eq!(transport.calls(), 2);

        // Open breaker: rejected with no I/O.
        let err = manager
            .execute("billing", ServiceRequest::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let manager = manager(Arc::new(RecordingScheduler::default()));
        let transport = ScriptedTransport::new(&[]);
        manager
            .register_service_with_transport(service(3, 10), transport.clone())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .execute_with("billing", ServiceRequest::get("/"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_service() {
        let manager = manager(Arc::new(RecordingScheduler::default()));
        let err = manager
            .execute("ghost", ServiceRequest::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_service_health_lists_services() {
        let manager = manager(Arc::new(RecordingScheduler::default()));
        manager
            .register_service_with_transport(service(1, 1), ScriptedTransport::new(&[500]))
            .await
            .unwrap();
        let _ = manager.execute("billing", ServiceRequest::get("/")).await;

        let health = manager.service_health().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].state, CircuitState::Open);
        assert_eq!(health[0].failure_count, 1);
    }

    #[test]
    fn test_service_config_validation() {
        assert!(ServiceConfig::new("billing", "https://billing").validate().is_ok());
        assert!(ServiceConfig::new("billing", "billing:8080").validate().is_err());
        assert!(ServiceConfig::new(" ", "https://billing").validate().is_err());
    }

    #[test]
    fn test_url_joining() {
        let config = ServiceConfig::new("billing", "https://billing/");
        assert_eq!(HttpTransport::url(&config, "/v1"), "https://billing/v1");
        assert_eq!(HttpTransport::url(&config, "v1"), "https://billing/v1");
        assert_eq!(HttpTransport::url(&config, ""), "https://billing");
    }

    #[test]
    fn test_failure_statuses() {
        assert!(is_failure_status(500));
        assert!(is_failure_status(429));
        assert!(!is_failure_status(404));
        assert!(!is_failure_status(200));
    }
}
