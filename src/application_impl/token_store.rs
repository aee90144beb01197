use crate::domain_model::{TokenPair, User};
use crate::domain_port::{Clock, KeyValueStore, StoreError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

pub const TOKEN_KEY: &str = "auth_tokens";
pub const RETAINED_REFRESH_KEY: &str = "auth_refresh_token";
pub const USER_KEY: &str = "user";

#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    pub default_ttl: Duration,
    pub expiry_margin: Duration,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            expiry_margin: Duration::from_secs(60),
        }
    }
}

/// Sole owner of the persisted credentials and the cached user record.
///
/// Values are base64-encoded before they hit storage. That is obfuscation
/// only; anything with access to the storage can decode them.
pub struct TokenStore {
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: TokenStoreConfig,
    epoch: AtomicU64,
    lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: TokenStoreConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            config,
            epoch: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Incremented whenever the stored session is cleared or replaced by
    /// `set_tokens`.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn set_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<TokenPair, StoreError> {
        self.set_tokens_with_ttl(access_token, refresh_token, self.config.default_ttl)
            .await
    }

    pub async fn set_tokens_with_ttl(
        &self,
        access_token: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<TokenPair, StoreError> {
        let _guard = self.lock.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.write_pair(access_token, refresh_token, ttl).await
    }

    /// Like `set_tokens_with_ttl`, but writes nothing and returns `None` if
    /// the store was cleared or given a new pair after `epoch` was observed.
    /// A successful write leaves the epoch unchanged.
    pub async fn set_tokens_in_epoch(
        &self,
        epoch: u64,
        access_token: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<Option<TokenPair>, StoreError> {
        let _guard = self.lock.lock().await;
        if self.epoch() != epoch {
            return Ok(None);
        }
        self.write_pair(access_token, refresh_token, ttl)
            .await
            .map(Some)
    }

    /// Returns the pair only while it is unexpired. An expired pair is
    /// removed from storage; its refresh token is kept aside so the session
    /// can still be renewed.
    pub async fn get_tokens(&self) -> Option<TokenPair> {
        let _guard = self.lock.lock().await;

        let encoded = match self.storage.get(TOKEN_KEY).await {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stored tokens");
                return None;
            }
        };

        let pair = match decode::<TokenPair>(&encoded) {
            Some(pair) => pair,
            None => {
                tracing::warn!("stored tokens are unreadable; clearing");
                self.clear_locked().await.ok();
                return None;
            }
        };

        if pair.is_expired_at(self.clock.now()) {
            tracing::debug!(expires_at = %pair.expires_at, "access token expired");
            if let Err(e) = self.retire_pair(&pair).await {
                tracing::warn!(error = %e, "failed to retire expired tokens");
            }
            return None;
        }

        Some(pair)
    }

    pub async fn get_access_token(&self) -> Option<String> {
        self.get_tokens().await.map(|pair| pair.access_token)
    }

    pub async fn get_refresh_token(&self) -> Option<String> {
        if let Some(pair) = self.get_tokens().await {
            return Some(pair.refresh_token);
        }

        let _guard = self.lock.lock().await;
        match self.storage.get(RETAINED_REFRESH_KEY).await {
            Ok(Some(encoded)) => decode::<String>(&encoded),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read retained refresh token");
                None
            }
        }
    }

    /// Removes the pair, any retained refresh token and the cached user.
    pub async fn clear_tokens(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.clear_locked().await
    }

    pub async fn cached_user(&self) -> Option<User> {
        let raw = match self.storage.get(USER_KEY).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read cached user");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(error = %e, "cached user is unreadable; dropping it");
                self.storage.remove(USER_KEY).await.ok();
                None
            }
        }
    }

    pub async fn set_cached_user(&self, user: &User) -> Result<(), StoreError> {
        let raw = serde_json::to_string(user).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.storage.set(USER_KEY, &raw).await
    }

    async fn write_pair(
        &self,
        access_token: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<TokenPair, StoreError> {
        let lifetime = ttl.saturating_sub(self.config.expiry_margin);
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| StoreError::Corrupt(format!("token lifetime out of range: {e}")))?;
        // persisted with millisecond precision; keep the returned pair identical
        let expires_at = self.clock.now() + lifetime;
        let expires_at =
            DateTime::from_timestamp_millis(expires_at.timestamp_millis()).unwrap_or(expires_at);
        let pair = TokenPair {
            access_token: access_token.to_owned(),
            refresh_token: refresh_token.to_owned(),
            expires_at,
        };

        self.storage.set(TOKEN_KEY, &encode(&pair)?).await?;
        self.storage.remove(RETAINED_REFRESH_KEY).await?;
        tracing::debug!(expires_at = %pair.expires_at, "stored token pair");
        Ok(pair)
    }

    async fn retire_pair(&self, pair: &TokenPair) -> Result<(), StoreError> {
        self.storage
            .set(RETAINED_REFRESH_KEY, &encode(&pair.refresh_token)?)
            .await?;
        self.storage.remove(TOKEN_KEY).await
    }

    async fn clear_locked(&self) -> Result<(), StoreError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.storage.remove(TOKEN_KEY).await?;
        self.storage.remove(RETAINED_REFRESH_KEY).await?;
        self.storage.remove(USER_KEY).await?;
        tracing::debug!("cleared stored credentials");
        Ok(())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

fn decode<T: serde::de::DeserializeOwned>(encoded: &str) -> Option<T> {
    let json = STANDARD.decode(encoded.trim()).ok()?;
    serde_json::from_slice(&json).ok()
}
