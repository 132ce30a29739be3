use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body returned by the login and refresh endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub token: String,
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `token` in seconds
    #[serde(rename = "expiresIn", default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub user: Option<Value>,
}

/// The stored session: bearer token, refresh token, expiry and profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: Option<Value>,
}

impl Credential {
    /// Build the credential a grant produces. Fields the grant omits keep
    /// their previous value, except the expiry which belongs to the old token.
    pub fn from_grant(grant: AuthGrant, previous: Option<&Credential>, now: DateTime<Utc>) -> Self {
        let expires_at = grant
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| now + Duration::seconds(secs));
        Self {
            access_token: grant.token,
            refresh_token: grant
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            expires_at,
            user: grant.user.or_else(|| previous.and_then(|p| p.user.clone())),
        }
    }

    /// True when the token expires within `buffer` of `now`. A credential
    /// without an expiry is always due.
    pub fn needs_refresh_at(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now + buffer >= expiry,
            None => true,
        }
    }

    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        self.needs_refresh_at(buffer, Utc::now())
    }

    /// Seconds remaining until expiry (for display)
    pub fn seconds_until_expiry(&self) -> i64 {
        self.expires_at
            .map(|e| (e - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }
}
