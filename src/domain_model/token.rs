use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Access/refresh credentials as persisted by the token store.
///
/// `expires_at` already has the safety margin subtracted, so callers can
/// compare it against "now" directly.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before the pair must be treated as expired; zero once past.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

// Token values must never reach the logs.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// RFC 3339 timestamp; used to derive the stored TTL when present.
    #[serde(default)]
    pub access_token_expiry: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn persisted_shape_uses_camel_case_and_millis() {
        let pair = TokenPair {
            access_token: "A1".to_string(),
            refresh_token: "R1".to_string(),
            expires_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        };
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(json["accessToken"], "A1");
        assert_eq!(json["refreshToken"], "R1");
        assert_eq!(json["expiresAt"], 1_700_000_000_123i64);
    }

    #[test]
    fn debug_output_hides_token_values() {
        let pair = TokenPair {
            access_token: "secret-access".to_string(),
            refresh_token: "secret-refresh".to_string(),
            expires_at: Utc::now(),
        };
        let printed = format!("{:?}", pair);
        assert!(!printed.contains("secret-access"));
        assert!(!printed.contains("secret-refresh"));
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let pair = TokenPair {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: now,
        };
        assert!(pair.is_expired_at(now));
        assert_eq!(pair.time_until_expiry(now), Duration::ZERO);
    }
}
