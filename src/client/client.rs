use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_port::*;
use crate::infra_http::*;
use crate::infra_storage::*;
use crate::logger::*;
use crate::settings::Settings;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fully wired session stack: storage, transport, token handling and the
/// facade, with the session-ended listener running.
pub struct Client {
    pub session: Arc<SessionFacade>,
    pub api: Arc<ApiClient>,
    coordinator: Arc<SessionCoordinator>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Client {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let storage: Arc<dyn KeyValueStore> =
            Arc::new(FileKeyValueStore::open(settings.session.storage_path.clone()).await?);
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(settings.api.timeout())?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Ok(Self::from_parts(settings, storage, transport, clock))
    }

    /// Must be called from within a tokio runtime.
    pub fn from_parts(
        settings: &Settings,
        storage: Arc<dyn KeyValueStore>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let base_url = settings.api.base_url.trim_end_matches('/').to_string();

        let store = Arc::new(TokenStore::new(
            storage,
            clock,
            TokenStoreConfig {
                default_ttl: settings.session.default_ttl(),
                expiry_margin: settings.session.expiry_margin(),
            },
        ));

        let (signal, receiver) = session_signal();

        let coordinator = Arc::new(
            SessionCoordinator::new(
                store,
                transport.clone(),
                CoordinatorConfig {
                    base_url: base_url.clone(),
                    timeout: settings.api.timeout(),
                    refresh_lead: settings.session.refresh_lead(),
                    min_refresh_delay: settings.session.min_refresh_delay(),
                },
            )
            .with_session_signal(signal.clone()),
        );

        let interceptor = Arc::new(RequestInterceptor::new(
            transport,
            coordinator.clone(),
            signal,
            InterceptorConfig {
                base_url,
                timeout: settings.api.timeout(),
                backoff_base: settings.api.backoff_base(),
                default_retries: settings.api.retries,
            },
        ));

        let query_cache: Arc<dyn QueryCache> = Arc::new(MemoryQueryCache::new());
        let api = Arc::new(ApiClient::new(interceptor, query_cache));
        let session = Arc::new(SessionFacade::new(api.clone(), coordinator.clone()));

        let cancel = CancellationToken::new();
        let listener_handle = session.spawn_signal_listener(receiver, cancel.clone());

        info!(base_url = %api.base_url(), "client started");

        Self {
            session,
            api,
            coordinator,
            listener_handle: Mutex::new(Some(listener_handle)),
            cancel,
        }
    }

    pub async fn shutdown(&self) {
        info!("client shutting down...");

        self.cancel.cancel();
        self.coordinator.shutdown().await;

        let handle = match self.listener_handle.lock() {
            Ok(mut lock) => lock.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let r = handle.await;
            info!("session listener dropped: {:?}", r);
        }
    }
}
