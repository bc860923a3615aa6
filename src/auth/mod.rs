//! Auth capability.
//!
//! | provider   | authenticate        | refresh                 | logout        |
//! |------------|---------------------|-------------------------|---------------|
//! | `auth0`    | password grant      | refresh grant           | token revoke  |
//! | `firebase` | Identity Toolkit    | secure token exchange   | local no-op   |
//! | `jwt`      | [`CredentialStore`] | reuses the refresh token | revocation list |
//! | `supabase` | GoTrue password     | GoTrue refresh          | GoTrue logout |
//!
//! `validate_token` reports a rejected token as `valid: false` rather than as
//! an error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ProviderConfig, DEFAULT_TIMEOUT_MS};
use crate::error::{Capability, ServiceError, ServiceResult};
use crate::provider::Provider;
use crate::registry::{ProviderTable, ProviderTableBuilder};

pub mod auth0;
pub mod firebase;
pub mod jwt;
pub mod supabase;

/// Email and password presented for sign-in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCredentials {
    pub email: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl AuthCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            provider: None,
        }
    }
}

impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("provider", &self.provider)
            .finish()
    }
}

/// An authenticated principal.
///
/// Dates the identity provider does not report are the Unix epoch; a
/// missing name falls back to the email address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Fails with an Authorization error unless the user holds `role`.
    pub fn require_role(&self, role: &str) -> ServiceResult<()> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(ServiceError::authorization_denied(format!(
                "user {} lacks role {}",
                self.id, role
            )))
        }
    }

    /// Fails with an Authorization error unless the user holds `permission`.
    pub fn require_permission(&self, permission: &str) -> ServiceResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ServiceError::authorization_denied(format!(
                "user {} lacks permission {}",
                self.id, permission
            )))
        }
    }
}

/// Tokens issued by a successful sign-in or refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub user: User,
}

/// Outcome of checking an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenValidation {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            user: None,
            expires_at: None,
        }
    }

    pub fn valid(user: User, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            valid: true,
            user: Some(user),
            expires_at,
        }
    }
}

/// User lookup backing the `jwt` provider.
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// The user whose credentials match, or `None`.
    async fn verify(&self, credentials: &AuthCredentials) -> ServiceResult<Option<User>>;

    /// The user with id `user_id`, or `None`.
    async fn find_user(&self, user_id: &str) -> ServiceResult<Option<User>>;
}

/// Auth capability contract.
#[async_trait]
pub trait AuthProvider: Provider {
    /// Exchange credentials for tokens.
    async fn authenticate(&self, credentials: &AuthCredentials) -> ServiceResult<AuthResult>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_token(&self, refresh_token: &str) -> ServiceResult<AuthResult>;

    /// Invalidate `token`.
    async fn logout(&self, token: &str) -> ServiceResult<()>;

    /// Check an access token.
    async fn validate_token(&self, token: &str) -> ServiceResult<TokenValidation>;
}

/// Configuration consumed by auth adapters.
///
/// Keys used per provider:
/// - `jwt`: `secret`, `expires_in` (default "15m"), `refresh_expires_in`
///   (default "7d"), `credential_store` (set in code)
/// - `auth0`: `domain`, `client_id`, `client_secret`, `audience`,
///   `claims_namespace` (default "https://devtechai.org")
/// - `firebase`: `api_key`, `base_url` (overrides both Google endpoints)
/// - `supabase`: `url`, `anon_key`
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub secret: Option<String>,
    pub expires_in: Option<String>,
    pub refresh_expires_in: Option<String>,
    pub domain: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub audience: Option<String>,
    pub claims_namespace: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(skip)]
    pub credential_store: Option<Arc<dyn CredentialStore>>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthConfig")
            .field("secret", &redact(&self.secret))
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("domain", &self.domain)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("audience", &self.audience)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("url", &self.url)
            .field("anon_key", &redact(&self.anon_key))
            .field("credential_store", &self.credential_store)
            .finish()
    }
}

impl ProviderConfig for AuthConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

/// Parse an RFC 3339 timestamp or a millisecond epoch string.
pub(crate) fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

pub(crate) fn from_epoch_seconds(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

type AuthTable = ProviderTable<dyn AuthProvider, AuthConfig>;

/// Resolves auth provider names to adapters.
#[derive(Debug)]
pub struct AuthServiceFactory {
    table: AuthTable,
}

impl AuthServiceFactory {
    /// Factory over the built-in providers.
    pub fn new() -> Self {
        Self::from_table(Self::builder().build())
    }

    /// Builder pre-populated with `auth0`, `firebase`, `jwt` and `supabase`.
    pub fn builder() -> ProviderTableBuilder<dyn AuthProvider, AuthConfig> {
        ProviderTableBuilder::new(Capability::Auth)
            .with("auth0", build_auth0)
            .with("firebase", build_firebase)
            .with("jwt", build_jwt)
            .with("supabase", build_supabase)
    }

    pub fn from_table(table: AuthTable) -> Self {
        Self { table }
    }

    /// Construct the adapter registered as `provider`.
    pub fn create_service(
        &self,
        provider: &str,
        config: &AuthConfig,
    ) -> ServiceResult<Arc<dyn AuthProvider>> {
        self.table.resolve(provider, config)
    }

    pub fn providers(&self) -> Vec<&str> {
        self.table.names()
    }
}

impl Default for AuthServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn build_auth0(config: &AuthConfig) -> ServiceResult<Arc<dyn AuthProvider>> {
    Ok(Arc::new(auth0::Auth0Auth::new(config)?))
}

fn build_firebase(config: &AuthConfig) -> ServiceResult<Arc<dyn AuthProvider>> {
    Ok(Arc::new(firebase::FirebaseAuth::new(config)?))
}

fn build_jwt(config: &AuthConfig) -> ServiceResult<Arc<dyn AuthProvider>> {
    Ok(Arc::new(jwt::JwtAuth::new(config)?))
}

fn build_supabase(config: &AuthConfig) -> ServiceResult<Arc<dyn AuthProvider>> {
    Ok(Arc::new(supabase::SupabaseAuth::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorDomain, ErrorKind};

    fn user() -> User {
        User {
            id: "u1".to_string(),
            email: "ann@example.com".to_string(),
            name: "Ann".to_string(),
            roles: vec!["admin".to_string()],
            permissions: vec!["contacts:read".to_string()],
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            last_login_at: None,
        }
    }

    #[test]
    fn test_require_role() {
        let user = user();
        assert!(user.require_role("admin").is_ok());
        let err = user.require_role("owner").unwrap_err();
        assert_eq!(err.domain(), ErrorDomain::Authorization);
    }

    #[test]
    fn test_require_permission() {
        let user = user();
        assert!(user.require_permission("contacts:read").is_ok());
        assert!(user.require_permission("contacts:write").is_err());
    }

    #[test]
    fn test_user_serializes_camel_case() {
        let json = serde_json::to_value(user()).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("lastLoginAt").is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = AuthCredentials::new("ann@example.com", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(
            parse_time(Some("1700000000000")),
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
        assert!(parse_time(Some("2024-01-01T00:00:00Z")).is_some());
        assert!(parse_time(Some("yesterday")).is_none());
        assert!(parse_time(None).is_none());
    }

    #[test]
    fn test_factory_unknown_provider() {
        let factory = AuthServiceFactory::new();
        assert_eq!(factory.providers(), vec!["auth0", "firebase", "jwt", "supabase"]);
        let err = factory
            .create_service("okta", &AuthConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
        assert!(err.message().contains("auth"));
    }
}
