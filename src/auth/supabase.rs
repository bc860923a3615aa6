//! Supabase Auth (GoTrue) adapter.
//!
//! Roles and permissions are read from the user's `app_metadata`; the
//! display name from `user_metadata.name` or `user_metadata.full_name`.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};

use super::jwt::unverified_claims;
use super::{
    from_epoch_seconds, parse_time, AuthConfig, AuthCredentials, AuthProvider, AuthResult,
    TokenValidation, User,
};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "supabase";
const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Deserialize)]
struct Session {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    user: Value,
}

/// Supabase auth adapter.
pub struct SupabaseAuth {
    http: HttpTransport,
    base: String,
    anon_key: String,
}

impl fmt::Debug for SupabaseAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseAuth")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl SupabaseAuth {
    pub fn new(config: &AuthConfig) -> ServiceResult<Self> {
        let url = required(&config.url, "url", ErrorDomain::Authentication, PROVIDER)?;
        let anon_key =
            required(&config.anon_key, "anon_key", ErrorDomain::Authentication, PROVIDER)?;
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Authentication, PROVIDER, config.timeout())?,
            base: base_url(url),
            anon_key: anon_key.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .client()
            .request(method, format!("{}/auth/v1/{}", self.base, path))
            .header("apikey", &self.anon_key)
    }

    async fn grant(&self, grant_type: &str, body: Value, context: &str) -> ServiceResult<Session> {
        let request = self
            .request(Method::POST, "token")
            .query(&[("grant_type", grant_type)])
            .json(&body);
        self.http
            .send_json(request, ErrorKind::AuthenticationFailed, context)
            .await
    }
}

fn result_from(session: Session, fallback_refresh: Option<&str>) -> AuthResult {
    AuthResult {
        user: user_from_gotrue(&session.user),
        refresh_token: session
            .refresh_token
            .or_else(|| fallback_refresh.map(str::to_string))
            .unwrap_or_default(),
        expires_in: session.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        access_token: session.access_token,
    }
}

fn user_from_gotrue(user: &Value) -> User {
    let text = |pointer: &str| user.pointer(pointer).and_then(Value::as_str);
    let list = |pointer: &str| -> Vec<String> {
        user.pointer(pointer)
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

    let email = text("/email").unwrap_or_default().to_string();
    let created_at = parse_time(text("/created_at")).unwrap_or_default();
    User {
        id: text("/id").unwrap_or_default().to_string(),
        name: text("/user_metadata/name")
            .or_else(|| text("/user_metadata/full_name"))
            .map(str::to_string)
            .unwrap_or_else(|| email.clone()),
        email,
        roles: list("/app_metadata/roles"),
        permissions: list("/app_metadata/permissions"),
        created_at,
        updated_at: parse_time(text("/updated_at")).unwrap_or(created_at),
        last_login_at: parse_time(text("/last_sign_in_at")),
    }
}

impl Provider for SupabaseAuth {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Auth
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn authenticate(&self, credentials: &AuthCredentials) -> ServiceResult<AuthResult> {
        let session = self
            .grant(
                "password",
                json!({
                    "email": credentials.email,
                    "password": credentials.password,
                }),
                "Invalid credentials",
            )
            .await?;
        Ok(result_from(session, None))
    }

    async fn refresh_token(&self, refresh_token: &str) -> ServiceResult<AuthResult> {
        let session = self
            .grant(
                "refresh_token",
                json!({ "refresh_token": refresh_token }),
                "Invalid refresh token",
            )
            .await?;
        Ok(result_from(session, Some(refresh_token)))
    }

    async fn logout(&self, token: &str) -> ServiceResult<()> {
        let request = self.request(Method::POST, "logout").bearer_auth(token);
        self.http
            .send_empty(request, ErrorKind::AuthenticationFailed, "Logout failed")
            .await
    }

    async fn validate_token(&self, token: &str) -> ServiceResult<TokenValidation> {
        let request = self.request(Method::GET, "user").bearer_auth(token);
        let user: ServiceResult<Value> = self
            .http
            .send_json(request, ErrorKind::AuthenticationFailed, "Token validation failed")
            .await;
        match user {
            Ok(user) => {
                let expires_at = unverified_claims(token)
                    .and_then(|claims| claims.get("exp").and_then(Value::as_i64))
                    .and_then(from_epoch_seconds);
                Ok(TokenValidation::valid(user_from_gotrue(&user), expires_at))
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
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AuthConfig {
        AuthConfig {
            url: Some(format!("{}/", server.uri())),
            anon_key: Some("anon".to_string()),
            ..Default::default()
        }
    }

    fn gotrue_user() -> Value {
        json!({
            "id": "8d0f",
            "email": "ann@example.com",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-02-01T00:00:00Z",
            "last_sign_in_at": "2024-02-01T00:00:00Z",
            "user_metadata": {"full_name": "Ann Example"},
            "app_metadata": {"provider": "email", "roles": ["member"]}
        })
    }

    #[test]
    fn test_user_from_gotrue() {
        let user = user_from_gotrue(&gotrue_user());
        assert_eq!(user.id, "8d0f");
        assert_eq!(user.name, "Ann Example");
        assert_eq!(user.roles, vec!["member".to_string()]);
        assert!(user.permissions.is_empty());
        assert!(user.last_login_at.is_some());
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3600,
                "token_type": "bearer",
                "user": gotrue_user()
            })))
            .mount(&server)
            .await;

        let auth = SupabaseAuth::new(&config(&server)).unwrap();
        let result = auth
            .authenticate(&AuthCredentials::new("ann@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(result.access_token, "at");
        assert_eq!(result.user.email, "ann@example.com");
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let auth = SupabaseAuth::new(&config(&server)).unwrap();
        let err = auth.refresh_token("stale").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(err.message(), "Invalid refresh token");
    }

    #[tokio::test]
    async fn test_logout_and_validate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("authorization", "Bearer at"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer at"))
            .respond_with(ResponseTemplate::new(200).set_body_json(gotrue_user()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = SupabaseAuth::new(&config(&server)).unwrap();
        assert!(auth.validate_token("at").await.unwrap().valid);
        assert!(!auth.validate_token("other").await.unwrap().valid);
        auth.logout("at").await.unwrap();
    }
}
