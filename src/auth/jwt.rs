//! Self-issued HS256 tokens.
//!
//! Access tokens carry `userId` and `email`; refresh tokens carry `userId`,
//! `email` and `type: "refresh"`. Every token has a `jti`, which is what
//! `logout` revokes. The revocation list lives in memory and is pruned of
//! expired entries on each logout.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    from_epoch_seconds, AuthConfig, AuthCredentials, AuthProvider, AuthResult, CredentialStore,
    TokenValidation, User,
};
use crate::config::{parse_duration, required};
use crate::error::{Capability, ErrorDomain, ServiceError, ServiceResult};
use crate::provider::Provider;

const PROVIDER: &str = "jwt";
const DEFAULT_EXPIRES_IN: &str = "15m";
const DEFAULT_REFRESH_EXPIRES_IN: &str = "7d";
const REFRESH_TYPE: &str = "refresh";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    iat: i64,
    exp: i64,
    jti: String,
}

impl Claims {
    fn is_refresh(&self) -> bool {
        self.token_type.as_deref() == Some(REFRESH_TYPE)
    }

    /// Principal reconstructed from the token alone.
    fn user(&self) -> User {
        let email = self.email.clone().unwrap_or_default();
        let issued = from_epoch_seconds(self.iat).unwrap_or_default();
        User {
            id: self.user_id.clone(),
            name: email.clone(),
            email,
            roles: Vec::new(),
            permissions: Vec::new(),
            created_at: issued,
            updated_at: issued,
            last_login_at: None,
        }
    }
}

/// HS256 token issuer and verifier.
pub struct JwtAuth {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    store: Option<Arc<dyn CredentialStore>>,
    revoked: RwLock<HashMap<String, i64>>,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl JwtAuth {
    pub fn new(config: &AuthConfig) -> ServiceResult<Self> {
        let secret = required(&config.secret, "secret", ErrorDomain::Authentication, PROVIDER)?;
        let access_ttl = parse_duration(
            config.expires_in.as_deref().unwrap_or(DEFAULT_EXPIRES_IN),
            "expires_in",
            ErrorDomain::Authentication,
        )?;
        let refresh_ttl = parse_duration(
            config
                .refresh_expires_in
                .as_deref()
                .unwrap_or(DEFAULT_REFRESH_EXPIRES_IN),
            "refresh_expires_in",
            ErrorDomain::Authentication,
        )?;
        if access_ttl.as_secs() == 0 {
            return Err(ServiceError::invalid_config(
                ErrorDomain::Authentication,
                "expires_in must be at least one second",
            ));
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            access_ttl,
            refresh_ttl,
            store: config.credential_store.clone(),
            revoked: RwLock::new(HashMap::new()),
        })
    }

    /// Issue an access and refresh token pair for a user the caller has
    /// already verified.
    pub fn issue(&self, user: &User) -> ServiceResult<AuthResult> {
        let access_token = self.access_token(user)?;
        let refresh_token = self.sign(&self.claims(user, Some(REFRESH_TYPE), self.refresh_ttl))?;
        Ok(AuthResult {
            access_token,
            refresh_token,
            expires_in: self.access_ttl.as_secs(),
            user: user.clone(),
        })
    }

    fn access_token(&self, user: &User) -> ServiceResult<String> {
        self.sign(&self.claims(user, None, self.access_ttl))
    }

    fn claims(&self, user: &User, token_type: Option<&str>, ttl: Duration) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            user_id: user.id.clone(),
            email: Some(user.email.clone()),
            token_type: token_type.map(str::to_string),
            iat: now,
            exp: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
            jti: Uuid::new_v4().to_string(),
        }
    }

    fn mac(&self) -> ServiceResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| {
            ServiceError::invalid_config(ErrorDomain::Authentication, "unusable signing secret")
                .with_cause(e)
        })
    }

    fn sign(&self, claims: &Claims) -> ServiceResult<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = serde_json::to_vec(claims).map_err(|e| {
            ServiceError::provider_call(ErrorDomain::Authentication, "cannot encode claims")
                .with_cause(e)
        })?;
        let signing_input = format!("{}.{}", header, URL_SAFE_NO_PAD.encode(payload));

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Check signature, algorithm and expiry. The error is the reason the
    /// token was rejected.
    fn verify(&self, token: &str) -> Result<Claims, &'static str> {
        let (signing_input, signature) = token.rsplit_once('.').ok_or("malformed token")?;
        let (header, payload) = signing_input.split_once('.').ok_or("malformed token")?;
        if payload.contains('.') {
            return Err("malformed token");
        }

        let header: Value = URL_SAFE_NO_PAD
            .decode(header)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or("malformed header")?;
        if header.get("alg").and_then(Value::as_str) != Some("HS256") {
            return Err("unexpected algorithm");
        }

        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| "malformed signature")?;
        let mut mac = self.mac().map_err(|_| "unusable secret")?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature).map_err(|_| "bad signature")?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or("malformed claims")?;
        if claims.exp <= Utc::now().timestamp() {
            return Err("expired");
        }
        Ok(claims)
    }

    async fn is_revoked(&self, claims: &Claims) -> bool {
        self.revoked.read().await.contains_key(&claims.jti)
    }

    async fn lookup(&self, claims: &Claims) -> ServiceResult<Option<User>> {
        match &self.store {
            Some(store) => store.find_user(&claims.user_id).await,
            None => Ok(Some(claims.user())),
        }
    }
}

/// Decode a JWT payload without checking its signature. Used to read `exp`
/// from tokens issued by a third party.
pub(crate) fn unverified_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl Provider for JwtAuth {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Auth
    }

    fn unsupported_operations(&self) -> &[&'static str] {
        if self.store.is_some() {
            &[]
        } else {
            &["authenticate"]
        }
    }
}

#[async_trait]
impl AuthProvider for JwtAuth {
    async fn authenticate(&self, credentials: &AuthCredentials) -> ServiceResult<AuthResult> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| self.unsupported("authenticate"))?;
        let user = store
            .verify(credentials)
            .await
            .map_err(|e| ServiceError::authentication_failed("Invalid credentials").with_cause(e))?
            .ok_or_else(|| ServiceError::authentication_failed("Invalid credentials"))?;
        tracing::debug!(provider = PROVIDER, user_id = %user.id, "issued tokens");
        self.issue(&user)
    }

    async fn refresh_token(&self, refresh_token: &str) -> ServiceResult<AuthResult> {
        let invalid = || ServiceError::authentication_failed("Invalid refresh token");
        let claims = self.verify(refresh_token).map_err(|reason| {
            tracing::debug!(provider = PROVIDER, reason, "refresh token rejected");
            invalid()
        })?;
        if !claims.is_refresh() || self.is_revoked(&claims).await {
            return Err(invalid());
        }
        let user = self
            .lookup(&claims)
            .await
            .map_err(|e| invalid().with_cause(e))?
            .ok_or_else(invalid)?;

        Ok(AuthResult {
            access_token: self.access_token(&user)?,
            refresh_token: refresh_token.to_string(),
            expires_in: self.access_ttl.as_secs(),
            user,
        })
    }

    async fn logout(&self, token: &str) -> ServiceResult<()> {
        let claims = self
            .verify(token)
            .map_err(|_| ServiceError::authentication_failed("Logout failed"))?;
        let now = Utc::now().timestamp();
        let mut revoked = self.revoked.write().await;
        revoked.retain(|_, exp| *exp > now);
        revoked.insert(claims.jti, claims.exp);
        Ok(())
    }

    async fn validate_token(&self, token: &str) -> ServiceResult<TokenValidation> {
        let claims = match self.verify(token) {
            Ok(claims) => claims,
            Err(reason) => {
                tracing::debug!(provider = PROVIDER, reason, "token rejected");
                return Ok(TokenValidation::invalid());
            }
        };
        if claims.is_refresh() || self.is_revoked(&claims).await {
            return Ok(TokenValidation::invalid());
        }
        Ok(match self.lookup(&claims).await? {
            Some(user) => TokenValidation::valid(user, from_epoch_seconds(claims.exp)),
            None => TokenValidation::invalid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::DateTime;

    #[derive(Debug)]
    struct OneUser;

    fn ann() -> User {
        User {
            id: "u1".to_string(),
            email: "ann@example.com".to_string(),
            name: "Ann".to_string(),
            roles: vec!["admin".to_string()],
            permissions: Vec::new(),
            created_at: DateTime::default(),
            updated_at: DateTime::default(),
            last_login_at: None,
        }
    }

    #[async_trait]
    impl CredentialStore for OneUser {
        async fn verify(&self, credentials: &AuthCredentials) -> ServiceResult<Option<User>> {
            Ok((credentials.email == "ann@example.com" && credentials.password == "pw")
                .then(ann))
        }

        async fn find_user(&self, user_id: &str) -> ServiceResult<Option<User>> {
            Ok((user_id == "u1").then(ann))
        }
    }

    fn config(store: bool) -> AuthConfig {
        AuthConfig {
            secret: Some("test-secret".to_string()),
            credential_store: store.then(|| Arc::new(OneUser) as Arc<dyn CredentialStore>),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_requires_secret() {
        let err = JwtAuth::new(&AuthConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.message().contains("secret"));
    }

    #[test]
    fn test_new_rejects_bad_duration() {
        let config = AuthConfig {
            expires_in: Some("soon".to_string()),
            ..config(false)
        };
        assert_eq!(
            JwtAuth::new(&config).unwrap_err().kind(),
            ErrorKind::InvalidConfiguration
        );
    }

    #[tokio::test]
    async fn test_authenticate_and_validate() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let result = auth
            .authenticate(&AuthCredentials::new("ann@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(result.expires_in, 900);
        assert_eq!(result.user.id, "u1");

        let validation = auth.validate_token(&result.access_token).await.unwrap();
        assert!(validation.valid);
        assert_eq!(validation.user.unwrap().roles, vec!["admin".to_string()]);
        assert!(validation.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let err = auth
            .authenticate(&AuthCredentials::new("ann@example.com", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(err.message(), "Invalid credentials");
    }

    #[tokio::test]
    async fn test_authenticate_without_store_is_unsupported() {
        let auth = JwtAuth::new(&config(false)).unwrap();
        assert!(!auth.supports("authenticate"));
        let err = auth
            .authenticate(&AuthCredentials::new("ann@example.com", "pw"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_issue_without_store_validates_from_claims() {
        let auth = JwtAuth::new(&config(false)).unwrap();
        let result = auth.issue(&ann()).unwrap();
        let user = auth
            .validate_token(&result.access_token)
            .await
            .unwrap()
            .user
            .unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email, "ann@example.com");
    }

    #[tokio::test]
    async fn test_refresh_reuses_refresh_token() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let first = auth.issue(&ann()).unwrap();
        let second = auth.refresh_token(&first.refresh_token).await.unwrap();
        assert_eq!(second.refresh_token, first.refresh_token);
        assert_ne!(second.access_token, first.access_token);
        assert!(auth.validate_token(&second.access_token).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_access_token_cannot_refresh() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let tokens = auth.issue(&ann()).unwrap();
        let err = auth.refresh_token(&tokens.access_token).await.unwrap_err();
        assert_eq!(err.message(), "Invalid refresh token");
        assert!(!auth.validate_token(&tokens.refresh_token).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_logout_revokes() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let tokens = auth.issue(&ann()).unwrap();
        auth.logout(&tokens.access_token).await.unwrap();
        assert!(!auth.validate_token(&tokens.access_token).await.unwrap().valid);

        auth.logout(&tokens.refresh_token).await.unwrap();
        assert!(auth.refresh_token(&tokens.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_logout_rejects_garbage() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let err = auth.logout("not-a-token").await.unwrap_err();
        assert_eq!(err.message(), "Logout failed");
    }

    #[tokio::test]
    async fn test_expired_token_is_invalid() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let mut claims = auth.claims(&ann(), None, Duration::from_secs(60));
        claims.exp = Utc::now().timestamp() - 10;
        let token = auth.sign(&claims).unwrap();
        assert!(!auth.validate_token(&token).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_foreign_signature_is_invalid() {
        let auth = JwtAuth::new(&config(true)).unwrap();
        let other = JwtAuth::new(&AuthConfig {
            secret: Some("other-secret".to_string()),
            ..config(true)
        })
        .unwrap();
        let token = other.issue(&ann()).unwrap().access_token;
        assert!(!auth.validate_token(&token).await.unwrap().valid);
        assert!(!auth.validate_token("a.b").await.unwrap().valid);
    }

    #[test]
    fn test_unverified_claims() {
        let auth = JwtAuth::new(&config(false)).unwrap();
        let token = auth.issue(&ann()).unwrap().access_token;
        let claims = unverified_claims(&token).unwrap();
        assert_eq!(claims["userId"], "u1");
        assert!(claims["exp"].is_i64());
        assert!(unverified_claims("garbage").is_none());
    }
}
