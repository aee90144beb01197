use crate::application_port::{SessionError, SessionSignal, TokenProvider};
use crate::domain_port::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub default_retries: u32,
}

impl InterceptorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            default_retries: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    /// Additional attempts after the first; the configured default when `None`.
    pub retries: Option<u32>,
    /// Public calls carry no token and treat 401 as a plain HTTP error.
    pub authenticated: bool,
}

impl RequestOptions {
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            body: None,
            headers: BTreeMap::new(),
            retries: None,
            authenticated: true,
        }
    }

    pub fn get() -> Self {
        Self::new(HttpMethod::Get)
    }

    pub fn post(body: Value) -> Self {
        Self::new(HttpMethod::Post).with_body(body)
    }

    pub fn put(body: Value) -> Self {
        Self::new(HttpMethod::Put).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn public(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

/// Wraps every outbound API call with token injection, a timeout, a single
/// refresh-and-replay on 401 and exponential backoff on transient failures.
pub struct RequestInterceptor {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<dyn TokenProvider>,
    signal: SessionSignal,
    config: InterceptorConfig,
}

impl RequestInterceptor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
        signal: SessionSignal,
        config: InterceptorConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            signal,
            config,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, SessionError> {
        self.request_json(endpoint, options).await
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, SessionError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "request",
            %request_id,
            method = %options.method,
            endpoint
        );
        self.with_retries(endpoint, &options).instrument(span).await
    }

    async fn with_retries<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<T, SessionError> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let retries = options.retries.unwrap_or(self.config.default_retries);

        let mut attempt = 0u32;
        loop {
            match self.attempt(&url, options).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= retries => {
                    tracing::warn!(attempt, error = %e, "request failed");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config.backoff_base.saturating_mul(factor)
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<T, SessionError> {
        let token = if options.authenticated {
            self.tokens.get_valid_access_token().await
        } else {
            None
        };
        let mut response = self.send(url, options, token.as_deref()).await?;

        if response.status == 401 && options.authenticated {
            tracing::info!("unauthorized; refreshing access token");
            let Some(tokens) = self.tokens.refresh_access_token().await else {
                self.signal.session_ended();
                return Err(SessionError::AuthenticationFailed);
            };
            // the replay is not subject to another refresh
            response = self
                .send(url, options, Some(tokens.access_token.as_str()))
                .await?;
        }

        decode(response)
    }

    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<HttpResponse, SessionError> {
        let mut request = HttpRequest::new(options.method, url);
        for (name, value) in &options.headers {
            request.set_header(name, value.clone());
        }
        if request.header("content-type").is_none() {
            request.set_header("content-type", "application/json");
        }
        request.set_header("accept", "application/json");
        if let Some(token) = token {
            request.set_header("authorization", format!("Bearer {token}"));
        }
        request.body = options.body.as_ref().map(Value::to_string);

        match tokio::time::timeout(self.config.timeout, self.transport.execute(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::Network(format!(
                "request timed out after {:?}",
                self.config.timeout
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(response: HttpResponse) -> Result<T, SessionError> {
    if response.is_success() {
        return response
            .json::<T>()
            .map_err(|e| SessionError::Decode(e.to_string()));
    }
    Err(SessionError::Http {
        status: response.status,
        message: error_message(&response),
    })
}

fn error_message(response: &HttpResponse) -> String {
    let from_body = serde_json::from_slice::<Value>(&response.body)
        .ok()
        .and_then(|body| {
            ["error", "message"]
                .iter()
                .find_map(|field| body.get(field).and_then(Value::as_str).map(str::to_owned))
        });
    from_body.unwrap_or_else(|| format!("HTTP error! status: {}", response.status))
}
