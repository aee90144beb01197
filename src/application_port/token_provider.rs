use crate::domain_model::TokenPair;

/// Source of bearer tokens for outbound requests.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// The current access token, refreshing first if it has expired.
    async fn get_valid_access_token(&self) -> Option<String>;
    /// Single-flight refresh. `None` means the session has ended.
    async fn refresh_access_token(&self) -> Option<TokenPair>;
}
