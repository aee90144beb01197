use crate::application_impl::{ApiClient, PROFILE_QUERY, SessionCoordinator, TokenStore};
use crate::application_port::{
    SessionError, SessionEvent, SessionService, SessionSignalReceiver, TokenProvider,
};
use crate::domain_model::{
    AuthResponse, LoginInput, LoginResult, ProfileUpdate, RegisterInput, SessionState, User,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the observable session state and is the only place a session is
/// established or torn down.
pub struct SessionFacade {
    api: Arc<ApiClient>,
    coordinator: Arc<SessionCoordinator>,
    store: Arc<TokenStore>,
    state: watch::Sender<SessionState>,
    /// Bumped by every teardown; results started under an older generation
    /// are dropped.
    generation: AtomicU64,
    write_lock: Mutex<()>,
}

impl SessionFacade {
    pub fn new(api: Arc<ApiClient>, coordinator: Arc<SessionCoordinator>) -> Self {
        let store = coordinator.store().clone();
        let (state, _) = watch::channel(SessionState::loading());
        Self {
            api,
            coordinator,
            store,
            state,
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Rebuilds the session from storage. `is_loading` stays set until this
    /// returns.
    pub async fn hydrate(&self) -> SessionState {
        let generation = self.generation();

        if self.store.get_tokens().await.is_some() {
            if let Some(user) = self.store.cached_user().await {
                tracing::info!(user_id = %user.id, "restored session from storage");
                if let Err(e) = self.authenticate(generation, user).await {
                    tracing::debug!(error = %e, "restored session superseded");
                }
                return self.state();
            }
        }

        if self.store.get_refresh_token().await.is_some() {
            match self.resume_with_refresh(generation).await {
                Ok(user) => tracing::info!(user_id = %user.id, "resumed session after refresh"),
                Err(e) => tracing::warn!(error = %e, "could not resume session"),
            }
        }

        self.finish_loading();
        self.state()
    }

    async fn resume_with_refresh(&self, generation: u64) -> Result<User, SessionError> {
        if self.coordinator.refresh_access_token().await.is_none() {
            return Err(SessionError::AuthenticationFailed);
        }
        let user = self.api.fetch_profile().await?;
        self.authenticate(generation, user.clone()).await?;
        Ok(user)
    }

    async fn authenticate(&self, generation: u64, user: User) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        if self.generation() != generation {
            return Err(SessionError::Superseded);
        }
        self.store.set_cached_user(&user).await?;
        self.state.send_replace(SessionState::authenticated(user));
        self.coordinator.setup_auto_refresh().await;
        Ok(())
    }

    fn finish_loading(&self) {
        self.state.send_if_modified(|state| {
            let was_loading = state.is_loading;
            state.is_loading = false;
            was_loading
        });
    }

    async fn establish(
        &self,
        generation: u64,
        response: AuthResponse,
    ) -> Result<LoginResult, SessionError> {
        let _guard = self.write_lock.lock().await;
        if self.generation() != generation {
            tracing::info!("discarding sign-in that completed after logout");
            return Err(SessionError::Superseded);
        }

        let tokens = self
            .store
            .set_tokens(&response.access_token, &response.refresh_token)
            .await?;
        self.store.set_cached_user(&response.user).await?;
        self.api.cache().invalidate(PROFILE_QUERY);
        self.state
            .send_replace(SessionState::authenticated(response.user.clone()));
        self.coordinator.setup_auto_refresh().await;

        tracing::info!(user_id = %response.user.id, "signed in");
        Ok(LoginResult {
            user: response.user,
            tokens,
        })
    }

    /// Fetches the current user from the backend and republishes it.
    pub async fn reload_profile(&self) -> Result<User, SessionError> {
        let generation = self.generation();
        let user = self.api.fetch_profile().await?;
        self.apply_user(generation, &user).await?;
        Ok(user)
    }

    async fn apply_user(&self, generation: u64, user: &User) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        let authenticated = self.state.borrow().is_authenticated;
        if self.generation() != generation || !authenticated {
            return Err(SessionError::Superseded);
        }
        self.store.set_cached_user(user).await?;
        self.state.send_modify(|state| state.user = Some(user.clone()));
        Ok(())
    }

    async fn teardown(&self, reason: &str) {
        let _guard = self.write_lock.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.coordinator.stop_auto_refresh();
        if let Err(e) = self.store.clear_tokens().await {
            tracing::error!(error = %e, "failed to clear stored credentials");
        }
        self.api.cache().clear();
        self.state.send_replace(SessionState::signed_out());
        tracing::info!(reason, "session torn down");
    }

    /// Tears the session down whenever a session-ended event arrives.
    pub fn spawn_signal_listener(
        self: &Arc<Self>,
        mut receiver: SessionSignalReceiver,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("session listener shutting down");
                        break;
                    }
                    event = receiver.recv() => match event {
                        Some(SessionEvent::Ended) => this.teardown("session ended").await,
                        None => break,
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl SessionService for SessionFacade {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResult, SessionError> {
        let generation = self.generation();
        let input = LoginInput {
            email: email.to_owned(),
            password: password.to_owned(),
        };
        let response = self.api.login(&input).await?;
        self.establish(generation, response).await
    }

    async fn register(&self, input: RegisterInput) -> Result<LoginResult, SessionError> {
        let generation = self.generation();
        let response = self.api.register(&input).await?;
        self.establish(generation, response).await
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<User, SessionError> {
        let generation = self.generation();
        let user = self.api.update_profile(&update).await?;
        self.apply_user(generation, &user).await?;
        Ok(user)
    }

    async fn logout(&self) {
        self.teardown("logout").await;
    }

    async fn refresh_token(&self) -> bool {
        if self.coordinator.refresh_access_token().await.is_some() {
            return true;
        }
        self.logout().await;
        false
    }

    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}
