//! Firebase Authentication adapter over the Identity Toolkit REST API.
//!
//! Roles and permissions come from the user's custom claims. Firebase has
//! no client-side session revocation, so `logout` only records the event;
//! ID tokens stay valid until they expire.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::jwt::unverified_claims;
use super::{
    from_epoch_seconds, parse_time, AuthConfig, AuthCredentials, AuthProvider, AuthResult,
    TokenValidation, User,
};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceError, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "firebase";
const IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com";
const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com";
const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

/// The secure token endpoint answers in snake_case.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<Value>,
}

/// Firebase auth adapter.
#[derive(Debug)]
pub struct FirebaseAuth {
    http: HttpTransport,
    identity_url: String,
    token_url: String,
    api_key: String,
}

impl FirebaseAuth {
    pub fn new(config: &AuthConfig) -> ServiceResult<Self> {
        let api_key = required(&config.api_key, "api_key", ErrorDomain::Authentication, PROVIDER)?;
        let (identity_url, token_url) = match config.base_url.as_deref() {
            Some(base) => (base_url(base), base_url(base)),
            None => (IDENTITY_URL.to_string(), SECURE_TOKEN_URL.to_string()),
        };
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Authentication, PROVIDER, config.timeout())?,
            identity_url,
            token_url,
            api_key: api_key.to_string(),
        })
    }

    async fn lookup(&self, id_token: &str, context: &str) -> ServiceResult<User> {
        let request = self
            .http
            .client()
            .post(format!("{}/v1/accounts:lookup", self.identity_url))
            .query(&[("key", &self.api_key)])
            .json(&json!({ "idToken": id_token }));
        let response: LookupResponse = self
            .http
            .send_json(request, ErrorKind::AuthenticationFailed, context)
            .await?;
        response
            .users
            .first()
            .map(user_from_account)
            .ok_or_else(|| ServiceError::authentication_failed(context))
    }
}

fn expires_in(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_EXPIRES_IN)
}

fn user_from_account(account: &Value) -> User {
    let text = |key: &str| account.get(key).and_then(Value::as_str);
    let claims: Value = text("customAttributes")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);
    let list = |key: &str| -> Vec<String> {
        claims
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let email = text("email").unwrap_or_default().to_string();
    let created_at = parse_time(text("createdAt")).unwrap_or_default();
    let last_login_at = parse_time(text("lastLoginAt"));
    User {
        id: text("localId").unwrap_or_default().to_string(),
        name: text("displayName")
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| email.clone()),
        email,
        roles: list("roles"),
        permissions: list("permissions"),
        created_at,
        updated_at: parse_time(text("lastRefreshAt"))
            .or(last_login_at)
            .unwrap_or(created_at),
        last_login_at,
    }
}

impl Provider for FirebaseAuth {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Auth
    }
}

#[async_trait]
impl AuthProvider for FirebaseAuth {
    async fn authenticate(&self, credentials: &AuthCredentials) -> ServiceResult<AuthResult> {
        let context = "Invalid credentials";
        let request = self
            .http
            .client()
            .post(format!("{}/v1/accounts:signInWithPassword", self.identity_url))
            .query(&[("key", &self.api_key)])
            .json(&json!({
                "email": credentials.email,
                "password": credentials.password,
                "returnSecureToken": true,
            }));
        let session: SignInResponse = self
            .http
            .send_json(request, ErrorKind::AuthenticationFailed, context)
            .await?;

        let user = self.lookup(&session.id_token, context).await?;
        Ok(AuthResult {
            expires_in: expires_in(session.expires_in.as_deref()),
            refresh_token: session.refresh_token.unwrap_or_default(),
            access_token: session.id_token,
            user,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> ServiceResult<AuthResult> {
        let context = "Invalid refresh token";
        let request = self
            .http
            .client()
            .post(format!("{}/v1/token", self.token_url))
            .query(&[("key", &self.api_key)])
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }));
        let session: RefreshResponse = self
            .http
            .send_json(request, ErrorKind::AuthenticationFailed, context)
            .await?;

        let user = self.lookup(&session.id_token, context).await?;
        Ok(AuthResult {
            expires_in: expires_in(session.expires_in.as_deref()),
            refresh_token: session
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            access_token: session.id_token,
            user,
        })
    }

    async fn logout(&self, _token: &str) -> ServiceResult<()> {
        tracing::debug!(provider = PROVIDER, "logout is local; token remains valid until expiry");
        Ok(())
    }

    async fn validate_token(&self, token: &str) -> ServiceResult<TokenValidation> {
        match self.lookup(token, "Token validation failed").await {
            Ok(user) => {
                let expires_at = unverified_claims(token)
                    .and_then(|claims| claims.get("exp").and_then(Value::as_i64))
                    .and_then(from_epoch_seconds);
                Ok(TokenValidation::valid(user, expires_at))
            }
            Err(e) => {
                tracing::debug!(provider = PROVIDER, error = %e, "token rejected");
                Ok(TokenValidation::invalid())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AuthConfig {
        AuthConfig {
            api_key: Some("key-1".to_string()),
            base_url: Some(server.uri()),
            ..Default::default()
        }
    }

    fn account() -> Value {
        json!({
            "localId": "fb-1",
            "email": "ann@example.com",
            "displayName": "",
            "createdAt": "1700000000000",
            "lastLoginAt": "1700000500000",
            "customAttributes": "{\"roles\":[\"editor\"],\"permissions\":[\"posts:write\"]}"
        })
    }

    async fn mock_lookup(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/accounts:lookup"))
            .and(body_json(json!({ "idToken": token })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [account()]
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_user_from_account() {
        let user = user_from_account(&account());
        assert_eq!(user.id, "fb-1");
        assert_eq!(user.name, "ann@example.com");
        assert_eq!(user.roles, vec!["editor".to_string()]);
        assert_eq!(user.permissions, vec!["posts:write".to_string()]);
        assert_eq!(user.created_at.timestamp(), 1_700_000_000);
        assert_eq!(user.updated_at, user.last_login_at.unwrap());
    }

    #[test]
    fn test_new_uses_google_endpoints() {
        let auth = FirebaseAuth::new(&AuthConfig {
            api_key: Some("k".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(auth.identity_url, IDENTITY_URL);
        assert_eq!(auth.token_url, SECURE_TOKEN_URL);
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/accounts:signInWithPassword"))
            .and(query_param("key", "key-1"))
            .and(body_partial_json(json!({
                "email": "ann@example.com",
                "returnSecureToken": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "localId": "fb-1",
                "idToken": "id-1",
                "refreshToken": "rt-1",
                "expiresIn": "3600"
            })))
            .mount(&server)
            .await;
        mock_lookup(&server, "id-1").await;

        let auth = FirebaseAuth::new(&config(&server)).unwrap();
        let result = auth
            .authenticate(&AuthCredentials::new("ann@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(result.access_token, "id-1");
        assert_eq!(result.refresh_token, "rt-1");
        assert_eq!(result.expires_in, 3600);
        assert_eq!(result.user.id, "fb-1");
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/accounts:signInWithPassword"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "INVALID_PASSWORD"}
            })))
            .mount(&server)
            .await;

        let auth = FirebaseAuth::new(&config(&server)).unwrap();
        let err = auth
            .authenticate(&AuthCredentials::new("ann@example.com", "bad"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(err.message(), "Invalid credentials");
    }

    #[tokio::test]
    async fn test_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .and(body_partial_json(json!({"grant_type": "refresh_token"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id_token": "id-2",
                "refresh_token": "rt-2",
                "expires_in": "1800",
                "user_id": "fb-1"
            })))
            .mount(&server)
            .await;
        mock_lookup(&server, "id-2").await;

        let auth = FirebaseAuth::new(&config(&server)).unwrap();
        let result = auth.refresh_token("rt-1").await.unwrap();
        assert_eq!(result.access_token, "id-2");
        assert_eq!(result.refresh_token, "rt-2");
        assert_eq!(result.expires_in, 1800);
    }

    #[tokio::test]
    async fn test_validate_token() {
        let server = MockServer::start().await;
        mock_lookup(&server, "id-1").await;
        Mock::given(method("POST"))
            .and(path("/v1/accounts:lookup"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let auth = FirebaseAuth::new(&config(&server)).unwrap();
        assert!(auth.validate_token("id-1").await.unwrap().valid);
        assert!(!auth.validate_token("stale").await.unwrap().valid);
        auth.logout("id-1").await.unwrap();
    }
}
