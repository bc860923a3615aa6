//! Configuration traits and process-level settings.
//!
//! Each capability has its own typed configuration struct (see
//! `DatabaseConfig`, `AuthConfig`, ...). Every provider-specific field is
//! optional; adapters check the keys they consume when they are constructed.
//! [`Settings`] bundles the provider name and configuration of every
//! capability and can be loaded from TOML or from the environment.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ai::AiConfig;
use crate::auth::AuthConfig;
use crate::database::DatabaseConfig;
use crate::error::{ErrorDomain, ServiceError, ServiceResult};
use crate::monitoring::MonitoringConfig;
use crate::workflow::WorkflowConfig;

/// Request timeout used when a configuration does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Base trait for capability configurations.
pub trait ProviderConfig: Send + Sync {
    /// Timeout applied to each call into the backing service.
    fn timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_TIMEOUT_MS)
    }

    /// Validates provider-independent fields.
    ///
    /// Returns Ok(()) if valid, or a message describing the issue.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Run [`ProviderConfig::validate`] and map a rejection into the domain's
/// `InvalidConfiguration` error.
pub(crate) fn validated<C: ProviderConfig>(config: &C, domain: ErrorDomain) -> ServiceResult<()> {
    config
        .validate()
        .map_err(|message| ServiceError::invalid_config(domain, message))
}

/// Fetch a required string key, rejecting absent or blank values.
pub(crate) fn required<'a>(
    value: &'a Option<String>,
    key: &str,
    domain: ErrorDomain,
    provider: &str,
) -> ServiceResult<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ServiceError::invalid_config(
            domain,
            format!("{} requires configuration key `{}`", provider, key),
        )),
    }
}

/// Parse a human readable duration such as `15m` or `7d`.
pub(crate) fn parse_duration(
    value: &str,
    key: &str,
    domain: ErrorDomain,
) -> ServiceResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| {
        ServiceError::invalid_config(domain, format!("invalid duration for `{}`: {}", key, value))
            .with_cause(e)
    })
}

/// Errors raised while loading [`Settings`].
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Provider name selected for each capability.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderNames {
    pub database: String,
    pub auth: String,
    pub ai: String,
    pub workflow: String,
    pub monitoring: String,
}

impl Default for ProviderNames {
    fn default() -> Self {
        Self {
            database: "postgresql".to_string(),
            auth: "jwt".to_string(),
            ai: "openai".to_string(),
            workflow: "n8n".to_string(),
            monitoring: "datadog".to_string(),
        }
    }
}

/// Process-level settings: one provider name and configuration per
/// capability.
///
/// # Example
///
/// ```rust
/// use servicekit::Settings;
///
/// let settings = Settings::from_toml_str(r#"
///     [providers]
///     database = "supabase"
///
///     [database]
///     url = "https://project.supabase.co"
///     anon_key = "public-anon-key"
/// "#).unwrap();
///
/// assert_eq!(settings.providers.database, "supabase");
/// assert_eq!(settings.providers.auth, "jwt");
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub providers: ProviderNames,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub ai: AiConfig,
    pub workflow: WorkflowConfig,
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Parse settings from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(source)?)
    }

    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let source = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Load settings from process environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    ///
    /// Recognized variables:
    /// - `DATABASE_PROVIDER` (default: "postgresql"), `DATABASE_HOST`,
    ///   `DATABASE_PORT`, `DATABASE_NAME`, `DATABASE_USER`, `DATABASE_PASSWORD`,
    ///   `DATABASE_MAX_CONNECTIONS`, `SUPABASE_URL`, `SUPABASE_ANON_KEY`,
    ///   `MONGODB_URI`, `MONGODB_DATABASE`, `FIREBASE_API_KEY`,
    ///   `FIREBASE_PROJECT_ID`
    /// - `AUTH_PROVIDER` (default: "jwt"), `JWT_SECRET`, `JWT_EXPIRES_IN`
    ///   (default: "15m"), `JWT_REFRESH_EXPIRES_IN` (default: "7d"),
    ///   `AUTH0_DOMAIN`, `AUTH0_CLIENT_ID`, `AUTH0_CLIENT_SECRET`
    /// - `AI_PROVIDER` (default: "openai"), `OPENAI_API_KEY`,
    ///   `OPENAI_ORGANIZATION`, `AZURE_OPENAI_ENDPOINT`
    /// - `WORKFLOW_PROVIDER` (default: "n8n"), `N8N_BASE_URL`, `N8N_API_KEY`
    /// - `MONITORING_PROVIDER` (default: "datadog"), `DATADOG_API_KEY`,
    ///   `DATADOG_APP_KEY`, `DATADOG_API_URL`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(name) = lookup("DATABASE_PROVIDER") {
            settings.providers.database = name;
        }
        if let Some(name) = lookup("AUTH_PROVIDER") {
            settings.providers.auth = name;
        }
        if let Some(name) = lookup("AI_PROVIDER") {
            settings.providers.ai = name;
        }
        if let Some(name) = lookup("WORKFLOW_PROVIDER") {
            settings.providers.workflow = name;
        }
        if let Some(name) = lookup("MONITORING_PROVIDER") {
            settings.providers.monitoring = name;
        }

        let db = &mut settings.database;
        db.host = lookup("DATABASE_HOST");
        db.port = parse_var(&lookup, "DATABASE_PORT")?;
        db.database = lookup("DATABASE_NAME").or_else(|| lookup("MONGODB_DATABASE"));
        db.user = lookup("DATABASE_USER");
        db.password = lookup("DATABASE_PASSWORD");
        db.max_connections = parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")?;
        db.url = lookup("SUPABASE_URL");
        db.anon_key = lookup("SUPABASE_ANON_KEY");
        db.connection_string = lookup("MONGODB_URI");
        db.api_key = lookup("FIREBASE_API_KEY");
        db.project_id = lookup("FIREBASE_PROJECT_ID");

        let auth = &mut settings.auth;
        auth.secret = lookup("JWT_SECRET");
        auth.expires_in = Some(lookup("JWT_EXPIRES_IN").unwrap_or_else(|| "15m".to_string()));
        auth.refresh_expires_in =
            Some(lookup("JWT_REFRESH_EXPIRES_IN").unwrap_or_else(|| "7d".to_string()));
        auth.domain = lookup("AUTH0_DOMAIN");
        auth.client_id = lookup("AUTH0_CLIENT_ID");
        auth.client_secret = lookup("AUTH0_CLIENT_SECRET");
        auth.api_key = lookup("FIREBASE_API_KEY");
        auth.url = lookup("SUPABASE_URL");
        auth.anon_key = lookup("SUPABASE_ANON_KEY");

        let ai = &mut settings.ai;
        ai.api_key = lookup("OPENAI_API_KEY");
        ai.organization = lookup("OPENAI_ORGANIZATION");
        ai.endpoint = lookup("AZURE_OPENAI_ENDPOINT");

        let workflow = &mut settings.workflow;
        workflow.api_url = lookup("N8N_BASE_URL");
        workflow.api_key = lookup("N8N_API_KEY");

        let monitoring = &mut settings.monitoring;
        monitoring.api_key = lookup("DATADOG_API_KEY");
        monitoring.app_key = lookup("DATADOG_APP_KEY");
        monitoring.api_url = lookup("DATADOG_API_URL");

        Ok(settings)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    #[test]
    fn test_default_provider_names() {
        let settings = Settings::default();
        assert_eq!(settings.providers.database, "postgresql");
        assert_eq!(settings.providers.auth, "jwt");
        assert_eq!(settings.providers.ai, "openai");
        assert_eq!(settings.providers.workflow, "n8n");
        assert_eq!(settings.providers.monitoring, "datadog");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_PROVIDER", "postgresql"),
            ("DATABASE_HOST", "db.internal"),
            ("DATABASE_PORT", "6543"),
            ("DATABASE_NAME", "site"),
            ("AI_PROVIDER", "anthropic"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let settings = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.database.host.as_deref(), Some("db.internal"));
        assert_eq!(settings.database.port, Some(6543));
        assert_eq!(settings.database.database.as_deref(), Some("site"));
        assert_eq!(settings.providers.ai, "anthropic");
        assert_eq!(settings.ai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.auth.expires_in.as_deref(), Some("15m"));
        assert_eq!(settings.auth.refresh_expires_in.as_deref(), Some("7d"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_port() {
        let err = Settings::from_lookup(|k| (k == "DATABASE_PORT").then(|| "five".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(
            &path,
            "[providers]\nmonitoring = \"datadog\"\n\n[monitoring]\napi_key = \"dd\"\n",
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.monitoring.api_key.as_deref(), Some("dd"));
    }

    #[test]
    fn test_from_file_missing() {
        let err = Settings::from_file(Path::new("/nonexistent/services.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }

    #[test]
    fn test_required_rejects_blank() {
        let blank = Some("   ".to_string());
        let err = required(&blank, "secret", ErrorDomain::Authentication, "jwt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.message().contains("secret"));

        let present = Some("value".to_string());
        assert_eq!(
            required(&present, "secret", ErrorDomain::Authentication, "jwt").unwrap(),
            "value"
        );
    }

    #[test]
    fn test_parse_duration() {
        let d = parse_duration("15m", "expires_in", ErrorDomain::Authentication).unwrap();
        assert_eq!(d, Duration::from_secs(900));
        let d = parse_duration("7d", "refresh_expires_in", ErrorDomain::Authentication).unwrap();
        assert_eq!(d, Duration::from_secs(7 * 24 * 3600));
        assert!(parse_duration("soon", "expires_in", ErrorDomain::Authentication).is_err());
    }
}
