//! Datadog adapter: metrics through `/api/v1/series`, logs through the
//! HTTP logs intake and events through `/api/v1/events`.

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::RequestBuilder;
use serde_json::{json, Map, Value};

use super::{MonitoringConfig, MonitoringProvider, Tags};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "datadog";
const API_URL: &str = "https://api.datadoghq.com";
const LOGS_URL: &str = "https://http-intake.logs.datadoghq.com";
const DEFAULT_SERVICE: &str = "servicekit";

fn tag_list(tags: &Tags) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("{}:{}", k, v)).collect()
}

/// Datadog monitoring adapter.
pub struct Datadog {
    http: HttpTransport,
    api_url: String,
    logs_url: String,
    api_key: String,
    app_key: Option<String>,
    service: String,
}

impl fmt::Debug for Datadog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datadog")
            .field("api_url", &self.api_url)
            .field("logs_url", &self.logs_url)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl Datadog {
    pub fn new(config: &MonitoringConfig) -> ServiceResult<Self> {
        let api_key = required(&config.api_key, "api_key", ErrorDomain::Monitoring, PROVIDER)?;
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Monitoring, PROVIDER, config.timeout())?,
            api_url: base_url(config.api_url.as_deref().unwrap_or(API_URL)),
            logs_url: base_url(config.logs_url.as_deref().unwrap_or(LOGS_URL)),
            api_key: api_key.to_string(),
            app_key: config.app_key.clone(),
            service: config
                .service
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
        })
    }

    fn post(&self, url: String, body: &Value) -> RequestBuilder {
        let request = self
            .http
            .client()
            .post(url)
            .header("DD-API-KEY", &self.api_key)
            .json(body);
        match &self.app_key {
            Some(app_key) => request.header("DD-APPLICATION-KEY", app_key),
            None => request,
        }
    }
}

impl Provider for Datadog {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Monitoring
    }
}

#[async_trait]
impl MonitoringProvider for Datadog {
    async fn send_metric(&self, name: &str, value: f64, tags: &Tags) -> ServiceResult<()> {
        let body = json!({
            "series": [{
                "metric": name,
                "type": "gauge",
                "points": [[Utc::now().timestamp(), value]],
                "tags": tag_list(tags),
            }]
        });
        self.http
            .send_empty(
                self.post(format!("{}/api/v1/series", self.api_url), &body),
                ErrorKind::ProviderCallFailed,
                "Failed to send metric",
            )
            .await
    }

    async fn send_log(
        &self,
        message: &str,
        level: &str,
        metadata: &Map<String, Value>,
    ) -> ServiceResult<()> {
        let mut entry = metadata.clone();
        entry.insert("message".to_string(), json!(message));
        entry.insert("status".to_string(), json!(level));
        entry
            .entry("service".to_string())
            .or_insert_with(|| json!(self.service));
        entry
            .entry("ddsource".to_string())
            .or_insert_with(|| json!("rust"));
        let body = Value::Array(vec![Value::Object(entry)]);
        self.http
            .send_empty(
                self.post(format!("{}/api/v2/logs", self.logs_url), &body),
                ErrorKind::ProviderCallFailed,
                "Failed to send log",
            )
            .await
    }

    async fn send_event(&self, title: &str, text: &str, tags: &Tags) -> ServiceResult<()> {
        let body = json!({
            "title": title,
            "text": text,
            "tags": tag_list(tags),
        });
        self.http
            .send_empty(
                self.post(format!("{}/api/v1/events", self.api_url), &body),
                ErrorKind::ProviderCallFailed,
                "Failed to send event",
            )
            .await
    }
}
