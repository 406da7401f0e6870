//! Credential snapshots and providers.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// An immutable credential snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiration: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Returns `true` if the snapshot has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// The secret and session token never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Source of credential snapshots.
///
/// Called once per signing operation; implementations may refresh behind
/// the scenes and return a newer snapshot on the next call.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}

/// Provider holding a replaceable in-memory snapshot.
#[derive(Default)]
pub struct StaticCredentialProvider {
    current: RwLock<Option<Credentials>>,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(Some(credentials)),
        }
    }

    /// A provider that never yields credentials.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replaces the snapshot (e.g. after the shell re-authenticates).
    pub fn set(&self, credentials: Option<Credentials>) {
        *self.current.write().unwrap() = credentials;
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn credentials(&self) -> Option<Credentials> {
        self.current.read().unwrap().clone()
    }
}

/// Reads credentials from environment variables on every call.
///
/// `UPLIFT_*` names take precedence over the conventional `AWS_*` ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    /// Resolves credentials through an arbitrary variable lookup.
    pub fn read_with(lookup: impl Fn(&str) -> Option<String>) -> Option<Credentials> {
        let var = |suffix: &str| {
            lookup(&format!("UPLIFT_{suffix}"))
                .or_else(|| lookup(&format!("AWS_{suffix}")))
                .filter(|v| !v.trim().is_empty())
        };

        let access_key_id = var("ACCESS_KEY_ID")?;
        let secret_access_key = var("SECRET_ACCESS_KEY")?;
        let mut creds = Credentials::new(access_key_id, secret_access_key);
        creds.session_token = var("SESSION_TOKEN");
        creds.expiration = var("SESSION_EXPIRATION")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Some(creds)
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self) -> Option<Credentials> {
        Self::read_with(|name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Duration;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let creds = Credentials::new("ak", "sk").with_expiration(now);
        assert!(creds.is_expired_at(now));
        assert!(!creds.is_expired_at(now - Duration::seconds(1)));
        assert!(!Credentials::new("ak", "sk").is_expired());
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::new("AKIDEXAMPLE", "super-secret").with_session_token("tok");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("tok\""));
    }

    #[test]
    fn static_provider_can_be_refreshed() {
        let provider = StaticCredentialProvider::empty();
        assert!(provider.credentials().is_none());
        provider.set(Some(Credentials::new("a", "b")));
        assert_eq!(provider.credentials().unwrap().access_key_id, "a");
    }

    #[test]
    fn env_prefers_uplift_names() {
        let creds = EnvCredentialProvider::read_with(lookup(&[
            ("UPLIFT_ACCESS_KEY_ID", "uplift-ak"),
            ("AWS_ACCESS_KEY_ID", "aws-ak"),
            ("AWS_SECRET_ACCESS_KEY", "aws-sk"),
            ("UPLIFT_SESSION_EXPIRATION", "2030-01-01T00:00:00Z"),
        ]))
        .unwrap();
        assert_eq!(creds.access_key_id, "uplift-ak");
        assert_eq!(creds.secret_access_key, "aws-sk");
        assert!(creds.session_token.is_none());
        assert_eq!(creds.expiration.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn env_requires_both_keys() {
        assert!(EnvCredentialProvider::read_with(lookup(&[("AWS_ACCESS_KEY_ID", "a")])).is_none());
        assert!(
            EnvCredentialProvider::read_with(lookup(&[
                ("AWS_ACCESS_KEY_ID", "a"),
                ("AWS_SECRET_ACCESS_KEY", "  "),
            ]))
            .is_none()
        );
    }
}
