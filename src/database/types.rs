//! Plain data exchanged with database adapters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Number, Value};

use crate::config::{ProviderConfig, DEFAULT_TIMEOUT_MS};

/// One result row, keyed by column or field name.
pub type Row = Map<String, Value>;

/// Connection lifecycle of a database adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Boolean parameter
    Bool(bool),
    /// Integer parameter
    Integer(i64),
    /// Floating point parameter
    Float(f64),
    /// Text parameter
    Text(String),
    /// Timestamp parameter
    Timestamp(DateTime<Utc>),
    /// JSON document parameter
    Json(Value),
    /// Text array parameter
    TextArray(Vec<String>),
}

impl SqlValue {
    /// Whether this value counts as "not supplied" for an optional filter:
    /// NULL or a blank string.
    pub fn is_absent(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Convert a JSON value into the closest parameter type.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s),
            Value::Array(items) if items.iter().all(Value::is_string) => SqlValue::TextArray(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            other => SqlValue::Json(other),
        }
    }

    /// Render this parameter as JSON (used by REST-backed adapters).
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Integer(i) => Value::Number((*i).into()),
            SqlValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Timestamp(t) => Value::String(t.to_rfc3339()),
            SqlValue::Json(v) => v.clone(),
            SqlValue::TextArray(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(value: Vec<String>) -> Self {
        SqlValue::TextArray(value)
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        SqlValue::from_json(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Configuration consumed by database adapters.
///
/// Keys used per provider:
/// - `postgresql`: `host` (default "localhost"), `port` (default 5432),
///   `database`, `user`, `password`, `ssl` (default false),
///   `max_connections` (default 20), `idle_timeout` (ms, default 30000),
///   `connection_timeout` (ms, default 2000)
/// - `supabase`: `url`, `anon_key`
/// - `firebase`: `project_id`, `api_key`, `base_url` (default
///   "https://firestore.googleapis.com/v1")
/// - `mongodb`: `connection_string`, `database`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: Option<bool>,
    pub max_connections: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub connection_timeout: Option<u64>,
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub connection_string: Option<String>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 20;
pub(crate) const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 2_000;

impl DatabaseConfig {
    /// Pool size, defaulting to 20.
    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// How long a pooled connection may sit unused before it is reaped.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS))
    }

    /// How long to wait for a new connection.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(
            self.connection_timeout
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
        )
    }
}

impl ProviderConfig for DatabaseConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.connection_timeout == Some(0) {
            return Err("connection_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_values() {
        assert!(SqlValue::Null.is_absent());
        assert!(SqlValue::from("").is_absent());
        assert!(SqlValue::from("  ").is_absent());
        assert!(SqlValue::from(None::<String>).is_absent());
        assert!(!SqlValue::from("ann").is_absent());
        assert!(!SqlValue::from(false).is_absent());
        assert!(!SqlValue::from(0).is_absent());
    }

    #[test]
    fn test_from_json() {
        assert_eq!(SqlValue::from_json(json!(3)), SqlValue::Integer(3));
        assert_eq!(SqlValue::from_json(json!(1.5)), SqlValue::Float(1.5));
        assert_eq!(
            SqlValue::from_json(json!(["admin", "editor"])),
            SqlValue::TextArray(vec!["admin".to_string(), "editor".to_string()])
        );
        assert_eq!(
            SqlValue::from_json(json!({"a": 1})),
            SqlValue::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_to_json() {
        assert_eq!(SqlValue::Integer(7).to_json(), json!(7));
        assert_eq!(SqlValue::from("x").to_json(), json!("x"));
        assert_eq!(SqlValue::Null.to_json(), Value::Null);
    }

    #[test]
    fn test_config_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections(), 20);
        assert_eq!(config.idle_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.connection_timeout(), Duration::from_millis(2_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = DatabaseConfig {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
