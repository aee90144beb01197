use crate::application_impl::{RequestInterceptor, RequestOptions};
use crate::application_port::{QueryCache, SessionError};
use crate::domain_model::{
    AuthResponse, FollowResult, HealthStatus, LoginInput, Page, ProfileUpdate, RegisterInput, User,
    UserId,
};
use crate::domain_port::HttpMethod;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use url::form_urlencoded;

pub const PROFILE_QUERY: &str = "profile";

/// Typed endpoints of the REST backend.
pub struct ApiClient {
    interceptor: Arc<RequestInterceptor>,
    cache: Arc<dyn QueryCache>,
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, SessionError> {
    serde_json::to_value(value).map_err(|e| SessionError::Decode(e.to_string()))
}

impl ApiClient {
    pub fn new(interceptor: Arc<RequestInterceptor>, cache: Arc<dyn QueryCache>) -> Self {
        Self { interceptor, cache }
    }

    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.cache
    }

    pub fn base_url(&self) -> &str {
        self.interceptor.base_url()
    }

    pub async fn login(&self, input: &LoginInput) -> Result<AuthResponse, SessionError> {
        let options = RequestOptions::post(to_body(input)?).public();
        self.interceptor.request_json("/auth/login", options).await
    }

    pub async fn register(&self, input: &RegisterInput) -> Result<AuthResponse, SessionError> {
        let options = RequestOptions::post(to_body(input)?).public();
        self.interceptor.request_json("/auth/register", options).await
    }

    /// Current user, served from the query cache when present.
    pub async fn profile(&self) -> Result<User, SessionError> {
        if let Some(cached) = self.cache.get(PROFILE_QUERY) {
            match serde_json::from_value::<User>(cached) {
                Ok(user) => return Ok(user),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping unreadable cached profile");
                    self.cache.invalidate(PROFILE_QUERY);
                }
            }
        }
        self.fetch_profile().await
    }

    /// Current user, always from the backend; refreshes the cached entry
    /// unless the cache was cleared while the request was in flight.
    pub async fn fetch_profile(&self) -> Result<User, SessionError> {
        let epoch = self.cache.epoch();
        let body: Value = self
            .interceptor
            .request_json("/users/me", RequestOptions::get())
            .await?;
        let user = decode::<User>(body.clone())?;
        self.cache.put_in_epoch(PROFILE_QUERY, body, epoch);
        Ok(user)
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, SessionError> {
        let user = self
            .interceptor
            .request_json("/users/me", RequestOptions::put(to_body(update)?))
            .await?;
        self.cache.invalidate(PROFILE_QUERY);
        Ok(user)
    }

    pub async fn search_users(&self, username: &str) -> Result<Page<User>, SessionError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("username", username)
            .finish();
        let key = format!("search?{query}");
        if let Some(page) = self.cache.get(&key).and_then(|v| decode(v).ok()) {
            return Ok(page);
        }

        let epoch = self.cache.epoch();
        let body: Value = self
            .interceptor
            .request_json(&format!("/users/search?{query}"), RequestOptions::get())
            .await?;
        let page = decode(body.clone())?;
        self.cache.put_in_epoch(&key, body, epoch);
        Ok(page)
    }

    pub async fn follow_user(&self, id: &UserId) -> Result<FollowResult, SessionError> {
        let id: String = form_urlencoded::byte_serialize(id.0.as_bytes()).collect();
        self.interceptor
            .request_json(
                &format!("/users/{id}/follow"),
                RequestOptions::new(HttpMethod::Post),
            )
            .await
    }

    pub async fn health_check(&self) -> Result<HealthStatus, SessionError> {
        self.interceptor
            .request_json("/webhooks/health", RequestOptions::get().public())
            .await
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, SessionError> {
    serde_json::from_value(value).map_err(|e| SessionError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::InterceptorConfig;
    use crate::application_port::{TokenProvider, session_signal};
    use crate::domain_model::TokenPair;
    use crate::infra_storage::MemoryQueryCache;
    use crate::testutil::*;
    use serde_json::json;
    use std::time::Duration;

    struct FixedToken;

    #[async_trait::async_trait]
    impl TokenProvider for FixedToken {
        async fn get_valid_access_token(&self) -> Option<String> {
            Some("A1".to_string())
        }

        async fn refresh_access_token(&self) -> Option<TokenPair> {
            None
        }
    }

    fn client(backend: Arc<FakeBackend>) -> (ApiClient, Arc<MemoryQueryCache>) {
        let (signal, _) = session_signal();
        let interceptor = Arc::new(RequestInterceptor::new(
            backend,
            Arc::new(FixedToken),
            signal,
            InterceptorConfig::new(BASE_URL),
        ));
        let cache = Arc::new(MemoryQueryCache::new());
        (ApiClient::new(interceptor, cache.clone()), cache)
    }

    #[tokio::test]
    async fn login_posts_credentials_without_token() {
        let backend = Arc::new(FakeBackend::new(|_| {
            respond(
                200,
                json!({
                    "success": true,
                    "accessToken": "A1",
                    "refreshToken": "R1",
                    "user": user_json("u1")
                }),
            )
        }));
        let (client, _) = client(backend.clone());

        let response = client
            .login(&LoginInput {
                email: "u1@example.com".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(response.access_token, "A1");
        assert_eq!(response.user.id, UserId("u1".to_string()));
        let request = &backend.requests()[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(path(request), "/auth/login");
        assert_eq!(request.header("authorization"), None);
        let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({ "email": "u1@example.com", "password": "secret" }));
    }

    #[tokio::test]
    async fn profile_is_cached_until_updated() {
        let backend = Arc::new(FakeBackend::new(|request| match request.method {
            HttpMethod::Get => respond(200, user_json("u1")),
            _ => {
                let mut user = user_json("u1");
                user["username"] = json!("renamed");
                respond(200, user)
            }
        }));
        let (client, cache) = client(backend.clone());

        client.profile().await.unwrap();
        client.profile().await.unwrap();
        assert_eq!(backend.calls_to("/users/me"), 1);
        assert!(cache.get(PROFILE_QUERY).is_some());

        let update = ProfileUpdate {
            username: Some("renamed".to_string()),
            ..Default::default()
        };
        let user = client.update_profile(&update).await.unwrap();
        assert_eq!(user.username, "renamed");
        assert!(cache.get(PROFILE_QUERY).is_none());

        client.profile().await.unwrap();
        assert_eq!(backend.calls_to("/users/me"), 3);
    }

    #[tokio::test]
    async fn profile_fetched_across_a_clear_is_not_cached() {
        let backend = Arc::new(
            FakeBackend::new(|_| respond(200, user_json("u1")))
                .with_latency(Duration::from_millis(50)),
        );
        let (client, cache) = client(backend);

        let (user, _) = tokio::join!(client.fetch_profile(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.clear();
        });

        assert_eq!(user.unwrap().username, "u1");
        assert!(cache.get(PROFILE_QUERY).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn search_encodes_the_username() {
        let backend = Arc::new(FakeBackend::new(|_| {
            respond(
                200,
                json!({
                    "results": [user_json("u2")],
                    "page": 1,
                    "limit": 10,
                    "totalPages": 1,
                    "totalDocs": 1,
                    "hasNextPage": false,
                    "hasPrevPage": false
                }),
            )
        }));
        let (client, _) = client(backend.clone());

        let page = client.search_users("bass & trout").await.unwrap();

        assert_eq!(page.results.len(), 1);
        assert_eq!(
            backend.requests()[0].url,
            format!("{BASE_URL}/users/search?username=bass+%26+trout")
        );
    }

    #[tokio::test]
    async fn follow_posts_to_user_endpoint() {
        let backend = Arc::new(FakeBackend::new(|_| {
            respond(
                200,
                json!({ "success": true, "isFollowing": true, "followersCount": 12 }),
            )
        }));
        let (client, _) = client(backend.clone());

        let result = client
            .follow_user(&UserId("u2".to_string()))
            .await
            .unwrap();

        assert!(result.is_following);
        assert_eq!(result.followers_count, 12);
        assert_eq!(path(&backend.requests()[0]), "/users/u2/follow");
    }

    #[tokio::test]
    async fn health_check_is_public() {
        let backend = Arc::new(FakeBackend::new(|_| {
            respond(200, json!({ "status": "ok", "timestamp": "2026-01-01T00:00:00Z" }))
        }));
        let (client, _) = client(backend.clone());

        assert_eq!(client.health_check().await.unwrap().status, "ok");
        assert_eq!(backend.requests()[0].header("authorization"), None);
    }
}
