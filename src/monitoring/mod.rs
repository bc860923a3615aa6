//! Monitoring capability: metrics, logs and events.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{ProviderConfig, DEFAULT_TIMEOUT_MS};
use crate::error::{Capability, ServiceResult};
use crate::provider::Provider;
use crate::registry::{ProviderTable, ProviderTableBuilder};

pub mod datadog;

/// Tag set attached to metrics and events. Ordered so payloads are stable.
pub type Tags = BTreeMap<String, String>;

/// Monitoring capability contract.
#[async_trait]
pub trait MonitoringProvider: Provider {
    async fn send_metric(&self, name: &str, value: f64, tags: &Tags) -> ServiceResult<()>;

    /// Ship a log line. `level` is passed through as the log status
    /// (`info`, `warn`, `error`, ...).
    async fn send_log(
        &self,
        message: &str,
        level: &str,
        metadata: &Map<String, Value>,
    ) -> ServiceResult<()>;

    async fn send_event(&self, title: &str, text: &str, tags: &Tags) -> ServiceResult<()>;
}

/// Configuration consumed by monitoring adapters.
///
/// `datadog` reads `api_key`, `app_key`, `api_url` (default
/// "https://api.datadoghq.com"), `logs_url` (default
/// "https://http-intake.logs.datadoghq.com") and `service`.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub api_key: Option<String>,
    pub app_key: Option<String>,
    pub api_url: Option<String>,
    pub logs_url: Option<String>,
    pub service: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl fmt::Debug for MonitoringConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("MonitoringConfig")
            .field("api_key", &redact(&self.api_key))
            .field("app_key", &redact(&self.app_key))
            .field("api_url", &self.api_url)
            .field("logs_url", &self.logs_url)
            .field("service", &self.service)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl ProviderConfig for MonitoringConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

type MonitoringTable = ProviderTable<dyn MonitoringProvider, MonitoringConfig>;

/// Resolves monitoring provider names to adapters.
#[derive(Debug)]
pub struct MonitoringServiceFactory {
    table: MonitoringTable,
}

impl MonitoringServiceFactory {
    pub fn new() -> Self {
        Self::from_table(Self::builder().build())
    }

    pub fn builder() -> ProviderTableBuilder<dyn MonitoringProvider, MonitoringConfig> {
        ProviderTableBuilder::new(Capability::Monitoring).with("datadog", build_datadog)
    }

    pub fn from_table(table: MonitoringTable) -> Self {
        Self { table }
    }

    pub fn create_service(
        &self,
        provider: &str,
        config: &MonitoringConfig,
    ) -> ServiceResult<Arc<dyn MonitoringProvider>> {
        self.table.resolve(provider, config)
    }

    pub fn providers(&self) -> Vec<&str> {
        self.table.names()
    }
}

impl Default for MonitoringServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn build_datadog(config: &MonitoringConfig) -> ServiceResult<Arc<dyn MonitoringProvider>> {
    Ok(Arc::new(datadog::Datadog::new(config)?))
}
