use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tokens handed back by a successful login exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginGrant {
    pub user_id: String,
    pub service_token: String,
    #[serde(default)]
    pub ssecurity: Option<String>,
    #[serde(default, rename = "cUserId")]
    pub cuser_id: Option<String>,
    #[serde(default)]
    pub pass_token: Option<String>,
}

impl fmt::Debug for LoginGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginGrant")
            .field("user_id", &self.user_id)
            .field("service_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub user_id: String,
    pub service_token: String,
    #[serde(default)]
    pub ssecurity: Option<String>,
    #[serde(default)]
    pub cuser_id: Option<String>,
    #[serde(default)]
    pub pass_token: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn from_grant(username: impl Into<String>, grant: LoginGrant, issued_at: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            user_id: grant.user_id,
            service_token: grant.service_token,
            ssecurity: grant.ssecurity,
            cuser_id: grant.cuser_id,
            pass_token: grant.pass_token,
            issued_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.issued_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("service_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub ttl: Duration,
}

impl ExpiryPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn from_hours(hours: u32) -> Self {
        Self::new(Duration::hours(i64::from(hours)))
    }

    pub fn expires_at(&self, credential: &Credential) -> DateTime<Utc> {
        credential.issued_at + self.ttl
    }

    /// A credential issued in the future is treated as expired too; the clock moved.
    pub fn is_expired(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        now >= self.expires_at(credential) || credential.issued_at > now
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::from_hours(24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credential(issued_at: DateTime<Utc>) -> Credential {
        Credential::from_grant(
            "alice",
            LoginGrant {
                user_id: "42".into(),
                service_token: "secret-token".into(),
                ssecurity: None,
                cuser_id: None,
                pass_token: None,
            },
            issued_at,
        )
    }

    #[test]
    fn expiry_is_inclusive_of_ttl_boundary() {
        let issued = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let policy = ExpiryPolicy::from_hours(24);
        let cred = credential(issued);
        assert!(!policy.is_expired(&cred, issued + Duration::hours(23)));
        assert!(policy.is_expired(&cred, issued + Duration::hours(24)));
        assert!(policy.is_expired(&cred, issued - Duration::minutes(5)));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let cred = credential(Utc::now());
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("alice"));
    }
}
