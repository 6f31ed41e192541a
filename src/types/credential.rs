use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The access/refresh token pair backing one signed-in session.
///
/// `issued_at` tracks when the access token was last minted so callers can
/// decide between reuse, a lightweight refresh, or full re-authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at: Utc::now(),
        }
    }

    /// A credential restored from storage, where the original issue time is
    /// unknown. Its age makes it look maximally stale.
    pub fn restored(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Time elapsed since the access token was minted. Clock skew that would
    /// produce a negative age clamps to zero.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
