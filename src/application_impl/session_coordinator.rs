use crate::application_impl::TokenStore;
use crate::application_port::{SessionSignal, TokenProvider};
use crate::domain_model::{RefreshResponse, TokenPair};
use crate::domain_port::{HttpMethod, HttpRequest, HttpTransport};
use chrono::DateTime;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const REFRESH_ENDPOINT: &str = "/auth/refresh-token";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// How long before expiry the background refresh fires.
    pub refresh_lead: Duration,
    /// Lower bound on the background refresh delay.
    pub min_refresh_delay: Duration,
}

impl CoordinatorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            refresh_lead: Duration::from_secs(300),
            min_refresh_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RefreshError {
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh request timed out")]
    Timeout,
    #[error("Refresh failed: {0}")]
    Status(u16),
    #[error("Invalid refresh response: {0}")]
    Malformed(String),
}

type RefreshFuture = Shared<BoxFuture<'static, Option<TokenPair>>>;
type InFlightSlot = Arc<Mutex<Option<RefreshFuture>>>;

/// Clears the in-flight slot once the shared refresh finishes or is dropped.
struct InFlightGuard {
    slot: InFlightSlot,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

struct AutoRefresh {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Performs the network half of a refresh; cheap to clone into the shared
/// future.
struct Refresher {
    store: Arc<TokenStore>,
    transport: Arc<dyn HttpTransport>,
    url: String,
    timeout: Duration,
}

impl Refresher {
    async fn perform(&self) -> Option<TokenPair> {
        let epoch = self.store.epoch();
        let Some(refresh_token) = self.store.get_refresh_token().await else {
            tracing::debug!("no refresh token available");
            return None;
        };

        let outcome = match self.request(&refresh_token).await {
            Ok(response) => self.store_response(epoch, response).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(pair)) => {
                tracing::info!(expires_at = %pair.expires_at, "access token refreshed");
                Some(pair)
            }
            Ok(None) => {
                tracing::info!("session changed while refreshing; discarding new tokens");
                self.store.get_tokens().await
            }
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed; clearing session");
                if let Err(e) = self.store.clear_tokens().await {
                    tracing::error!(error = %e, "failed to clear tokens after refresh failure");
                }
                None
            }
        }
    }

    async fn request(&self, refresh_token: &str) -> Result<RefreshResponse, RefreshError> {
        let mut request = HttpRequest::new(HttpMethod::Get, self.url.clone());
        request.set_header("authorization", format!("Bearer {refresh_token}"));
        request.set_header("content-type", "application/json");
        request.set_header("accept", "application/json");

        let response = tokio::time::timeout(self.timeout, self.transport.execute(request))
            .await
            .map_err(|_| RefreshError::Timeout)?
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.is_success() {
            return Err(RefreshError::Status(response.status));
        }
        response
            .json::<RefreshResponse>()
            .map_err(|e| RefreshError::Malformed(e.to_string()))
    }

    async fn store_response(
        &self,
        epoch: u64,
        response: RefreshResponse,
    ) -> Result<Option<TokenPair>, RefreshError> {
        let (access_token, refresh_token) = match (response.access_token, response.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                (access, refresh)
            }
            _ => return Err(RefreshError::Malformed("missing tokens".to_string())),
        };

        let ttl = response
            .access_token_expiry
            .as_deref()
            .and_then(|expiry| self.ttl_until(expiry))
            .unwrap_or_else(|| self.store.default_ttl());

        self.store
            .set_tokens_in_epoch(epoch, &access_token, &refresh_token, ttl)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))
    }

    fn ttl_until(&self, expiry: &str) -> Option<Duration> {
        let expiry = DateTime::parse_from_rfc3339(expiry).ok()?;
        let ttl = (expiry.to_utc() - self.store.now()).to_std().ok()?;
        (!ttl.is_zero()).then_some(ttl)
    }
}

/// Keeps an access token valid across concurrent callers.
///
/// All refreshes, whether triggered by a caller, a 401 or the background
/// schedule, go through one gate so at most one refresh call is in flight.
pub struct SessionCoordinator {
    store: Arc<TokenStore>,
    refresher: Arc<Refresher>,
    config: CoordinatorConfig,
    in_flight: InFlightSlot,
    auto_refresh: Mutex<Option<AutoRefresh>>,
    signal: Option<SessionSignal>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<TokenStore>,
        transport: Arc<dyn HttpTransport>,
        config: CoordinatorConfig,
    ) -> Self {
        let refresher = Arc::new(Refresher {
            store: store.clone(),
            transport,
            url: format!("{}{}", config.base_url, REFRESH_ENDPOINT),
            timeout: config.timeout,
        });
        Self {
            store,
            refresher,
            config,
            in_flight: Arc::new(Mutex::new(None)),
            auto_refresh: Mutex::new(None),
            signal: None,
        }
    }

    /// Background refresh failures are reported on `signal`.
    pub fn with_session_signal(mut self, signal: SessionSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub async fn is_access_token_valid(&self) -> bool {
        self.store.get_tokens().await.is_some()
    }

    fn shared_refresh(&self) -> RefreshFuture {
        let mut slot = match self.in_flight.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pending) = slot.as_ref() {
            tracing::debug!("joining in-flight token refresh");
            return pending.clone();
        }

        let refresher = self.refresher.clone();
        let guard = InFlightGuard {
            slot: self.in_flight.clone(),
        };
        let future = async move {
            let _guard = guard;
            refresher.perform().await
        }
        .boxed()
        .shared();
        *slot = Some(future.clone());
        future
    }

    fn refresh_delay(&self, tokens: &TokenPair) -> Duration {
        tokens
            .time_until_expiry(self.store.now())
            .saturating_sub(self.config.refresh_lead)
            .max(self.config.min_refresh_delay)
    }

    /// Schedules a refresh shortly before the stored pair expires and keeps
    /// rescheduling after each success. Replaces any running schedule.
    /// Returns `false` (and schedules nothing) when no tokens are stored.
    pub async fn setup_auto_refresh(self: &Arc<Self>) -> bool {
        let Some(tokens) = self.store.get_tokens().await else {
            return false;
        };
        let delay = self.refresh_delay(&tokens);

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run_auto_refresh(delay, task_cancel).await });

        let previous = match self.auto_refresh.lock() {
            Ok(mut slot) => slot.replace(AutoRefresh { cancel, handle }),
            Err(poisoned) => poisoned.into_inner().replace(AutoRefresh { cancel, handle }),
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        tracing::debug!(?delay, "auto refresh scheduled");
        true
    }

    pub fn stop_auto_refresh(&self) {
        let current = match self.auto_refresh.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(current) = current {
            current.cancel.cancel();
            tracing::debug!("auto refresh stopped");
        }
    }

    pub fn is_auto_refresh_scheduled(&self) -> bool {
        match self.auto_refresh.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|task| !task.handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Stops the background schedule and waits for it to exit.
    pub async fn shutdown(&self) {
        let current = match self.auto_refresh.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(current) = current {
            current.cancel.cancel();
            let r = current.handle.await;
            tracing::debug!("auto refresh task joined: {:?}", r);
        }
    }

    async fn run_auto_refresh(&self, mut delay: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if self.refresh_access_token().await.is_none() {
                if !cancel.is_cancelled() {
                    tracing::warn!("background token refresh failed; session ended");
                    if let Some(signal) = &self.signal {
                        signal.session_ended();
                    }
                }
                break;
            }

            match self.store.get_tokens().await {
                Some(tokens) => delay = self.refresh_delay(&tokens),
                None => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl TokenProvider for SessionCoordinator {
    async fn get_valid_access_token(&self) -> Option<String> {
        if let Some(tokens) = self.store.get_tokens().await {
            return Some(tokens.access_token);
        }
        self.refresh_access_token()
            .await
            .map(|tokens| tokens.access_token)
    }

    async fn refresh_access_token(&self) -> Option<TokenPair> {
        self.shared_refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_port::{SessionEvent, session_signal};
    use crate::domain_port::{Clock, HttpResponse, TransportError};
    use crate::testutil::*;
    use futures_util::future::join_all;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(
        store: Arc<TokenStore>,
        backend: Arc<FakeBackend>,
    ) -> Arc<SessionCoordinator> {
        Arc::new(SessionCoordinator::new(
            store,
            backend,
            CoordinatorConfig::new(BASE_URL),
        ))
    }

    fn counting_refresh() -> impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> {
        let counter = AtomicUsize::new(0);
        move |request| {
            assert_eq!(path(request), REFRESH_ENDPOINT);
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            respond(200, refreshed_tokens(n))
        }
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_call() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend =
            Arc::new(FakeBackend::new(counting_refresh()).with_latency(Duration::from_millis(50)));
        let coordinator = coordinator(store.clone(), backend.clone());

        let results = join_all((0..8).map(|_| coordinator.refresh_access_token())).await;

        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 1);
        let first = results[0].clone().unwrap();
        assert_eq!(first.access_token, "access-1");
        assert!(results.iter().all(|r| r.as_ref() == Some(&first)));
        assert_eq!(store.get_tokens().await, Some(first));
    }

    #[tokio::test]
    async fn refresh_sends_refresh_token_as_bearer() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend.clone());

        coordinator.refresh_access_token().await.unwrap();

        let request = &backend.requests()[0];
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.header("Authorization"), Some("Bearer R0"));
    }

    #[tokio::test]
    async fn gate_reopens_after_each_refresh() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend.clone());

        let first = coordinator.refresh_access_token().await.unwrap();
        let second = coordinator.refresh_access_token().await.unwrap();

        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 2);
        assert_ne!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn refresh_landing_after_new_pair_keeps_the_new_pair() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend =
            Arc::new(FakeBackend::new(counting_refresh()).with_latency(Duration::from_millis(50)));
        let coordinator = coordinator(store.clone(), backend);

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_access_token().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fresh = store.set_tokens("A1", "R1").await.unwrap();

        assert_eq!(pending.await.unwrap(), Some(fresh.clone()));
        assert_eq!(store.get_tokens().await, Some(fresh));
    }

    #[tokio::test]
    async fn failed_refresh_clears_session_and_does_not_block_next_attempt() {
        let clock = ManualClock::new();
        let (storage, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(|_| respond(500, json!({}))));
        let coordinator = coordinator(store.clone(), backend.clone());

        assert_eq!(coordinator.refresh_access_token().await, None);
        assert!(storage.is_empty());

        store.set_tokens("A1", "R1").await.unwrap();
        assert_eq!(coordinator.refresh_access_token().await, None);
        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 2);
    }

    #[tokio::test]
    async fn malformed_refresh_response_ends_session() {
        let clock = ManualClock::new();
        let (storage, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(|_| {
            respond(200, json!({ "accessToken": "only-access" }))
        }));
        let coordinator = coordinator(store, backend);

        assert_eq!(coordinator.refresh_access_token().await, None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_ends_session() {
        let clock = ManualClock::new();
        let (storage, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(|_| {
            Err(TransportError::Transport("connection refused".to_string()))
        }));
        let coordinator = coordinator(store, backend);

        assert_eq!(coordinator.refresh_access_token().await, None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn no_refresh_token_means_no_network_call() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend.clone());

        assert_eq!(coordinator.get_valid_access_token().await, None);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refreshing() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend.clone());

        assert!(coordinator.is_access_token_valid().await);
        assert_eq!(
            coordinator.get_valid_access_token().await.as_deref(),
            Some("A0")
        );
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_with_retained_refresh_token() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock.clone());
        store.set_tokens("A0", "R0").await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend.clone());

        assert!(!coordinator.is_access_token_valid().await);
        assert_eq!(
            coordinator.get_valid_access_token().await.as_deref(),
            Some("access-1")
        );
        assert_eq!(
            backend.requests()[0].header("authorization"),
            Some("Bearer R0")
        );
    }

    #[tokio::test]
    async fn server_expiry_sets_stored_lifetime() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock.clone());
        store.set_tokens("A0", "R0").await.unwrap();
        let expiry = (clock.now() + chrono::Duration::minutes(15)).to_rfc3339();
        let backend = Arc::new(FakeBackend::new(move |_| {
            respond(
                200,
                json!({
                    "accessToken": "A1",
                    "refreshToken": "R1",
                    "accessTokenExpiry": expiry
                }),
            )
        }));
        let coordinator = coordinator(store, backend);

        let pair = coordinator.refresh_access_token().await.unwrap();
        // fifteen minutes minus the one-minute safety margin
        assert_eq!((pair.expires_at - clock.now()).num_seconds(), 14 * 60);
    }

    #[tokio::test]
    async fn refresh_finishing_after_logout_does_not_resurrect_tokens() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend =
            Arc::new(FakeBackend::new(counting_refresh()).with_latency(Duration::from_millis(50)));
        let coordinator = coordinator(store.clone(), backend);

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_access_token().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear_tokens().await.unwrap();

        assert_eq!(pending.await.unwrap(), None);
        assert_eq!(store.get_tokens().await, None);
        assert_eq!(store.get_refresh_token().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_fires_five_minutes_before_expiry() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store.clone(), backend.clone());

        assert!(coordinator.setup_auto_refresh().await);

        // expiry is 3540s away, so the refresh is due after 3240s
        tokio::time::sleep(Duration::from_secs(3239)).await;
        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 1);
        assert_eq!(store.get_access_token().await.as_deref(), Some("access-1"));

        // and keeps rescheduling itself
        tokio::time::sleep(Duration::from_secs(3240)).await;
        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 2);

        coordinator.shutdown().await;
        assert!(!coordinator.is_auto_refresh_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_waits_at_least_one_minute() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store
            .set_tokens_with_ttl("A0", "R0", Duration::from_secs(120))
            .await
            .unwrap();
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend.clone());

        assert!(coordinator.setup_auto_refresh().await);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.calls_to(REFRESH_ENDPOINT), 1);

        coordinator.stop_auto_refresh();
    }

    #[tokio::test]
    async fn auto_refresh_without_tokens_is_a_no_op() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        let backend = Arc::new(FakeBackend::new(counting_refresh()));
        let coordinator = coordinator(store, backend);

        assert!(!coordinator.setup_auto_refresh().await);
        assert!(!coordinator.is_auto_refresh_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_failure_signals_session_end() {
        let clock = ManualClock::new();
        let (_, store) = memory_token_store(clock);
        store.set_tokens("A0", "R0").await.unwrap();
        let backend = Arc::new(FakeBackend::new(|_| respond(401, json!({}))));
        let (signal, mut receiver) = session_signal();
        let coordinator = Arc::new(
            SessionCoordinator::new(store, backend, CoordinatorConfig::new(BASE_URL))
                .with_session_signal(signal),
        );

        assert!(coordinator.setup_auto_refresh().await);

        assert_eq!(receiver.recv().await, Some(SessionEvent::Ended));
    }
}
