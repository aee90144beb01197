use crate::application_port::SessionError;
use crate::domain_model::{LoginResult, ProfileUpdate, RegisterInput, SessionState, User};
use tokio::sync::watch;

#[async_trait::async_trait]
pub trait SessionService: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResult, SessionError>;
    async fn register(&self, input: RegisterInput) -> Result<LoginResult, SessionError>;
    async fn update_profile(&self, update: ProfileUpdate) -> Result<User, SessionError>;
    /// Idempotent.
    async fn logout(&self);
    /// Refreshes the token pair; logs out and returns `false` on failure.
    async fn refresh_token(&self) -> bool;

    fn state(&self) -> SessionState;
    fn subscribe(&self) -> watch::Receiver<SessionState>;

    fn is_authenticated(&self) -> bool {
        self.state().is_authenticated
    }

    fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    fn user(&self) -> Option<User> {
        self.state().user
    }
}
