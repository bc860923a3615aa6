//! Auth0 adapter over the Authentication API.
//!
//! Sign-in uses the resource owner password grant, so the application must
//! have the `password` grant enabled. Roles and permissions are read from
//! namespaced claims on the user profile (`{namespace}/roles`,
//! `{namespace}/permissions`).

use std::fmt;

use async_trait::async_trait;
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

const PROVIDER: &str = "auth0";
const DEFAULT_NAMESPACE: &str = "https://devtechai.org";
const DEFAULT_EXPIRES_IN: u64 = 86_400;
const SCOPE: &str = "openid profile email";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Auth0 auth adapter.
pub struct Auth0Auth {
    http: HttpTransport,
    base: String,
    client_id: String,
    client_secret: String,
    audience: Option<String>,
    namespace: String,
}

impl fmt::Debug for Auth0Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth0Auth")
            .field("base", &self.base)
            .field("client_id", &self.client_id)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl Auth0Auth {
    /// `domain` may be a bare tenant host (`tenant.auth0.com`) or a full URL.
    pub fn new(config: &AuthConfig) -> ServiceResult<Self> {
        let domain = required(&config.domain, "domain", ErrorDomain::Authentication, PROVIDER)?;
        let client_id =
            required(&config.client_id, "client_id", ErrorDomain::Authentication, PROVIDER)?;
        let client_secret = required(
            &config.client_secret,
            "client_secret",
            ErrorDomain::Authentication,
            PROVIDER,
        )?;
        let base = if domain.starts_with("http://") || domain.starts_with("https://") {
            base_url(domain)
        } else {
            format!("https://{}", base_url(domain))
        };
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Authentication, PROVIDER, config.timeout())?,
            base,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            audience: config.audience.clone(),
            namespace: config
                .claims_namespace
                .as_deref()
                .map(base_url)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        })
    }

    async fn token(&self, mut grant: Value, context: &str) -> ServiceResult<TokenResponse> {
        grant["client_id"] = json!(self.client_id);
        grant["client_secret"] = json!(self.client_secret);
        if let Some(audience) = &self.audience {
            grant["audience"] = json!(audience);
        }
        let request = self
            .http
            .client()
            .post(format!("{}/oauth/token", self.base))
            .json(&grant);
        self.http
            .send_json(request, ErrorKind::AuthenticationFailed, context)
            .await
    }

    async fn profile(&self, access_token: &str, context: &str) -> ServiceResult<User> {
        let request = self
            .http
            .client()
            .get(format!("{}/userinfo", self.base))
            .bearer_auth(access_token);
        let profile: Value = self
            .http
            .send_json(request, ErrorKind::AuthenticationFailed, context)
            .await?;
        Ok(self.user_from_profile(&profile))
    }

    fn user_from_profile(&self, profile: &Value) -> User {
        let text = |key: &str| profile.get(key).and_then(Value::as_str);
        let list = |claim: &str| -> Vec<String> {
            profile
                .get(format!("{}/{}", self.namespace, claim))
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
        let updated_at = parse_time(text("updated_at")).unwrap_or_default();
        User {
            id: text("sub").unwrap_or_default().to_string(),
            name: text("name").map(str::to_string).unwrap_or_else(|| email.clone()),
            email,
            roles: list("roles"),
            permissions: list("permissions"),
            created_at: parse_time(text("created_at")).unwrap_or(updated_at),
            updated_at,
            last_login_at: parse_time(text("last_login")),
        }
    }

    async fn session(
        &self,
        tokens: TokenResponse,
        fallback_refresh: Option<&str>,
        context: &str,
    ) -> ServiceResult<AuthResult> {
        let user = self.profile(&tokens.access_token, context).await?;
        Ok(AuthResult {
            refresh_token: tokens
                .refresh_token
                .or_else(|| fallback_refresh.map(str::to_string))
                .unwrap_or_default(),
            expires_in: tokens.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            access_token: tokens.access_token,
            user,
        })
    }
}

impl Provider for Auth0Auth {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Auth
    }
}

#[async_trait]
impl AuthProvider for Auth0Auth {
    async fn authenticate(&self, credentials: &AuthCredentials) -> ServiceResult<AuthResult> {
        let context = "Invalid credentials";
        let tokens = self
            .token(
                json!({
                    "grant_type": "password",
                    "username": credentials.email,
                    "password": credentials.password,
                    "scope": SCOPE,
                }),
                context,
            )
            .await?;
        self.session(tokens, None, context).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> ServiceResult<AuthResult> {
        let context = "Invalid refresh token";
        let tokens = self
            .token(
                json!({
                    "grant_type": "refresh_token",
                    "refresh_token": refresh_token,
                }),
                context,
            )
            .await?;
        self.session(tokens, Some(refresh_token), context).await
    }

    async fn logout(&self, token: &str) -> ServiceResult<()> {
        let request = self
            .http
            .client()
            .post(format!("{}/oauth/revoke", self.base))
            .json(&json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "token": token,
            }));
        self.http
            .send_empty(request, ErrorKind::AuthenticationFailed, "Logout failed")
            .await
    }

    async fn validate_token(&self, token: &str) -> ServiceResult<TokenValidation> {
        match self.profile(token, "Token validation failed").await {
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
