//! In-memory access credential storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A short-lived bearer credential for upstream API calls.
///
/// Lives only in process memory; cleared on logout or refresh failure and
/// never persisted across restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    /// Opaque bearer token value.
    pub token: String,
    /// Expiry instant, when known. `None` means the issuer reported no
    /// expiry and the credential counts as fresh until replaced.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Whether the remaining TTL exceeds `min_ttl`.
    pub fn fresh_for(&self, min_ttl: Duration) -> bool {
        match self.expires_at {
            Some(at) => {
                let remaining = at.signed_duration_since(Utc::now());
                remaining.num_milliseconds() > min_ttl.as_millis() as i64
            }
            None => true,
        }
    }
}

/// Shared cell holding the current credential.
///
/// At most one credential is current at a time; readers see either a whole
/// credential or none, never a half-written value.
#[derive(Clone, Default)]
pub struct CredentialStore {
    current: Arc<Mutex<Option<Credential>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.current.lock().clone()
    }

    /// Return the current credential only if its remaining TTL exceeds
    /// `min_ttl`.
    pub fn fresh(&self, min_ttl: Duration) -> Option<Credential> {
        self.current
            .lock()
            .clone()
            .filter(|c| c.fresh_for(min_ttl))
    }

    /// Replace the current credential.
    pub fn set(&self, credential: Credential) {
        *self.current.lock() = Some(credential);
    }

    /// Drop the current credential.
    pub fn clear(&self) {
        *self.current.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn fresh_respects_min_ttl() {
        let store = CredentialStore::new();
        let expires = Utc::now() + ChronoDuration::seconds(30);
        store.set(Credential::new("tok", Some(expires)));

        assert!(store.fresh(Duration::from_secs(10)).is_some());
        assert!(store.fresh(Duration::from_secs(60)).is_none());
        // The credential itself is still stored even when stale.
        assert!(store.get().is_some());
    }

    #[test]
    fn credential_without_expiry_is_always_fresh() {
        let store = CredentialStore::new();
        store.set(Credential::new("tok", None));
        assert!(store.fresh(Duration::from_secs(3600)).is_some());
    }

    #[test]
    fn clear_removes_credential() {
        let store = CredentialStore::new();
        store.set(Credential::new("tok", None));
        store.clear();
        assert!(store.get().is_none());
    }

    #[test]
    fn expired_credential_is_not_fresh() {
        let expired = Credential::new("tok", Some(Utc::now() - ChronoDuration::seconds(5)));
        assert!(!expired.fresh_for(Duration::ZERO));
    }
}
