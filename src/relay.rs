//! Request relay: performs HTTP calls on behalf of callers that cannot, and
//! carries them across the in-process bridge between caller and worker.

use crate::errors::{RelayError, Result};
use crate::profile::is_absolute_url;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string())])
}

/// One request handed to the relay
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
}

impl RelayRequest {
    /// Form POST with the default content type
    pub fn post_form(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            body: body.into(),
            headers: default_headers(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// Message sent across the bridge to the relay worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BridgeMessage {
    MakeApiRequest(RelayRequest),
}

/// Terminal outcome of a relayed request.
///
/// On the wire this is `{success: true, data}` or `{success: false, error}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireOutcome", try_from = "WireOutcome")]
pub enum RelayOutcome {
    Success(Value),
    Failure(String),
}

impl RelayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Success(_))
    }

    /// Decoded data, or the failure message as a transport error
    pub fn into_result(self) -> Result<Value> {
        match self {
            RelayOutcome::Success(data) => Ok(data),
            RelayOutcome::Failure(message) => Err(RelayError::Transport(message)),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireOutcome {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<RelayOutcome> for WireOutcome {
    fn from(outcome: RelayOutcome) -> Self {
        match outcome {
            RelayOutcome::Success(data) => WireOutcome {
                success: true,
                data: Some(data),
                error: None,
            },
            RelayOutcome::Failure(error) => WireOutcome {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<WireOutcome> for RelayOutcome {
    type Error = String;

    fn try_from(wire: WireOutcome) -> std::result::Result<Self, Self::Error> {
        if wire.success {
            Ok(RelayOutcome::Success(wire.data.unwrap_or(Value::Null)))
        } else {
            Ok(RelayOutcome::Failure(
                wire.error.unwrap_or_else(|| "Unknown error occurred".to_string()),
            ))
        }
    }
}

/// Anything that can execute a relay request and report exactly one outcome
#[async_trait]
pub trait Relay: Send + Sync {
    async fn dispatch(&self, request: RelayRequest) -> RelayOutcome;
}

/// Dispatch with a caller-side deadline.
///
/// Elapsing the deadline is reported as `RelayError::Timeout`, distinct from a
/// failure outcome. Whatever the relay produces afterwards is discarded.
pub async fn dispatch_with_timeout(
    relay: &dyn Relay,
    request: RelayRequest,
    operation: &'static str,
    after: Duration,
) -> Result<RelayOutcome> {
    match tokio::time::timeout(after, relay.dispatch(request)).await {
        Ok(outcome) => Ok(outcome),
        Err(_) => {
            warn!("{} got no relay response within {:?}", operation, after);
            Err(RelayError::Timeout { operation, after })
        }
    }
}

/// Relay backed by a reqwest client
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: Client,
}

impl HttpRelay {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("shortlink_relay/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Other(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn header_map(headers: &BTreeMap<String, String>) -> std::result::Result<HeaderMap, String> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name '{}'", name))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header '{}'", name))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    async fn execute(&self, request: &RelayRequest) -> std::result::Result<Value, String> {
        if request.url.trim().is_empty() {
            return Err("API URL is required".to_string());
        }
        if !is_absolute_url(&request.url) {
            return Err(format!("'{}' is not an absolute URL", request.url));
        }

        let headers = Self::header_map(&request.headers)?;

        let builder = match request.method {
            HttpMethod::Post => self
                .client
                .request(Method::POST, &request.url)
                .body(request.body.clone()),
            HttpMethod::Get if request.body.is_empty() => {
                self.client.request(Method::GET, &request.url)
            }
            HttpMethod::Get => {
                let separator = if request.url.contains('?') { '&' } else { '?' };
                let url = format!("{}{}{}", request.url, separator, request.body);
                self.client.request(Method::GET, url)
            }
        };

        let response = builder
            .headers(headers)
            .send()
            .await
            .map_err(|e| format!("network error: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!(
                "HTTP error {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            ));
        }

        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {}", e))?;

        serde_json::from_str(&text).map_err(|e| format!("invalid JSON in response: {}", e))
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn dispatch(&self, request: RelayRequest) -> RelayOutcome {
        debug!(
            "Relaying {:?} {} ({} byte body)",
            request.method,
            request.url,
            request.body.len()
        );

        match self.execute(&request).await {
            Ok(data) => RelayOutcome::Success(data),
            Err(message) => {
                error!("API request to {} failed: {}", request.url, message);
                RelayOutcome::Failure(message)
            }
        }
    }
}

struct Envelope {
    id: Uuid,
    message: BridgeMessage,
    reply: oneshot::Sender<RelayOutcome>,
}

/// Caller side of the bridge; cheap to clone
#[derive(Clone, Debug)]
pub struct RelayHandle {
    sender: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Relay for RelayHandle {
    async fn dispatch(&self, request: RelayRequest) -> RelayOutcome {
        let (reply, response) = oneshot::channel();
        let envelope = Envelope {
            id: Uuid::new_v4(),
            message: BridgeMessage::MakeApiRequest(request),
            reply,
        };

        if self.sender.send(envelope).await.is_err() {
            return RelayOutcome::Failure("relay worker is not running".to_string());
        }

        response
            .await
            .unwrap_or_else(|_| RelayOutcome::Failure("relay worker dropped the request".to_string()))
    }
}

/// Start the worker side of the bridge.
///
/// Every message is handled on its own task so a slow request never delays
/// the next one. The worker stops once every handle is dropped.
pub fn spawn_relay(relay: Arc<dyn Relay>, queue_depth: usize) -> (RelayHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<Envelope>(queue_depth.max(1));

    let worker = tokio::spawn(async move {
        info!("Relay worker started");

        while let Some(envelope) = receiver.recv().await {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                let Envelope { id, message, reply } = envelope;
                let outcome = match message {
                    BridgeMessage::MakeApiRequest(request) => relay.dispatch(request).await,
                };

                if reply.send(outcome).is_err() {
                    debug!("Caller for request {} is gone, dropping late response", id);
                }
            });
        }

        info!("Relay worker stopped");
    });

    (RelayHandle { sender }, worker)
}

/// Relay wrapper that records call statistics
#[derive(Debug)]
pub struct InstrumentedRelay<R> {
    inner: R,
    metrics: RelayMetrics,
}

impl<R: Relay> InstrumentedRelay<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            metrics: RelayMetrics::default(),
        }
    }

    pub async fn metrics(&self) -> RelayMetricsSnapshot {
        self.metrics.snapshot().await
    }
}

#[async_trait]
impl<R: Relay> Relay for InstrumentedRelay<R> {
    async fn dispatch(&self, request: RelayRequest) -> RelayOutcome {
        let started = Instant::now();
        let outcome = self.inner.dispatch(request).await;
        self.metrics
            .record(outcome.is_success(), started.elapsed())
            .await;
        outcome
    }
}

#[derive(Debug, Default)]
struct RelayMetrics {
    state: RwLock<MetricsState>,
}

#[derive(Debug, Default)]
struct MetricsState {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

impl RelayMetrics {
    async fn record(&self, success: bool, duration: Duration) {
        let mut state = self.state.write().await;
        state.attempts += 1;
        if success {
            state.successes += 1;
        } else {
            state.failures += 1;
        }
        state.total_duration += duration;
        state.min_duration = Some(state.min_duration.map_or(duration, |m| m.min(duration)));
        state.max_duration = Some(state.max_duration.map_or(duration, |m| m.max(duration)));
    }

    async fn snapshot(&self) -> RelayMetricsSnapshot {
        let state = self.state.read().await;

        let success_rate = if state.attempts > 0 {
            (state.successes as f64 / state.attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if state.attempts > 0 {
            state.total_duration / state.attempts as u32
        } else {
            Duration::ZERO
        };

        RelayMetricsSnapshot {
            attempts: state.attempts,
            successes: state.successes,
            failures: state.failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: state.min_duration.map(|d| d.as_millis() as u64),
            max_duration_ms: state.max_duration.map(|d| d.as_millis() as u64),
        }
    }
}

/// Snapshot of relay statistics
#[derive(Debug, Clone, Serialize)]
pub struct RelayMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}
