//! Shared fakes for the `#[cfg(test)]` modules in the crate.

use crate::application_impl::{TokenStore, TokenStoreConfig};
use crate::domain_port::{Clock, HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::infra_storage::MemoryKeyValueStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_URL: &str = "http://api.test/v1";

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(whole_millis(Utc::now())),
        })
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

fn whole_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// In-process stand-in for the REST backend. Records every request.
pub struct FakeBackend {
    handler: Box<Handler>,
    latency: Duration,
    requests: Mutex<Vec<HttpRequest>>,
    arrivals: Mutex<Vec<tokio::time::Instant>>,
}

impl FakeBackend {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            arrivals: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Gaps between consecutive requests, in arrival order.
    pub fn gaps(&self) -> Vec<Duration> {
        let arrivals = self.arrivals.lock().unwrap();
        arrivals.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| path(request) == endpoint)
            .count()
    }
}

#[async_trait::async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        self.arrivals.lock().unwrap().push(tokio::time::Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(&request)
    }
}

/// Endpoint part of the request URL, without the base or query string.
pub fn path(request: &HttpRequest) -> &str {
    let rest = request.url.strip_prefix(BASE_URL).unwrap_or(&request.url);
    rest.split('?').next().unwrap_or(rest)
}

pub fn respond(status: u16, body: serde_json::Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(status, body.to_string()))
}

pub fn user_json(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "email": format!("{id}@example.com"),
        "username": id,
        "fullName": "Test Angler",
        "role": ["user"]
    })
}

pub fn refreshed_tokens(n: usize) -> serde_json::Value {
    json!({
        "accessToken": format!("access-{n}"),
        "refreshToken": format!("refresh-{n}")
    })
}

pub fn memory_token_store(clock: Arc<ManualClock>) -> (Arc<MemoryKeyValueStore>, Arc<TokenStore>) {
    let storage = Arc::new(MemoryKeyValueStore::new());
    let store = Arc::new(TokenStore::new(
        storage.clone(),
        clock,
        TokenStoreConfig::default(),
    ));
    (storage, store)
}
