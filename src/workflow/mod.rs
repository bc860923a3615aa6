//! Workflow capability.
//!
//! A workflow is an ordered list of steps; each step has an id, a node type
//! and free-form configuration. Only the `n8n` provider is built in.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ProviderConfig, DEFAULT_TIMEOUT_MS};
use crate::error::{Capability, ServiceResult};
use crate::provider::Provider;
use crate::registry::{ProviderTable, ProviderTableBuilder};

pub mod n8n;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Success,
    Failed,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Workflow capability contract.
#[async_trait]
pub trait WorkflowProvider: Provider {
    async fn create_workflow(&self, name: &str, steps: &[WorkflowStep]) -> ServiceResult<Workflow>;

    /// Run a workflow with `data` as its input.
    ///
    /// A run that the engine reports as failed is returned as a result with
    /// [`WorkflowStatus::Failed`], not as an error.
    async fn execute_workflow(&self, workflow_id: &str, data: &Value)
        -> ServiceResult<WorkflowResult>;

    async fn get_workflow(&self, workflow_id: &str) -> ServiceResult<Workflow>;

    async fn list_workflows(&self) -> ServiceResult<Vec<Workflow>>;

    async fn delete_workflow(&self, workflow_id: &str) -> ServiceResult<()>;
}

/// Configuration consumed by workflow adapters.
///
/// `n8n` reads `api_url`, `api_key` and `webhook_url` (defaults to
/// `api_url`).
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl fmt::Debug for WorkflowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("webhook_url", &self.webhook_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl ProviderConfig for WorkflowConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

type WorkflowTable = ProviderTable<dyn WorkflowProvider, WorkflowConfig>;

/// Resolves workflow provider names to adapters.
#[derive(Debug)]
pub struct WorkflowServiceFactory {
    table: WorkflowTable,
}

impl WorkflowServiceFactory {
    pub fn new() -> Self {
        Self::from_table(Self::builder().build())
    }

    pub fn builder() -> ProviderTableBuilder<dyn WorkflowProvider, WorkflowConfig> {
        ProviderTableBuilder::new(Capability::Workflow).with("n8n", build_n8n)
    }

    pub fn from_table(table: WorkflowTable) -> Self {
        Self { table }
    }

    pub fn create_service(
        &self,
        provider: &str,
        config: &WorkflowConfig,
    ) -> ServiceResult<Arc<dyn WorkflowProvider>> {
        self.table.resolve(provider, config)
    }

    pub fn providers(&self) -> Vec<&str> {
        self.table.names()
    }
}

impl Default for WorkflowServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn build_n8n(config: &WorkflowConfig) -> ServiceResult<Arc<dyn WorkflowProvider>> {
    Ok(Arc::new(n8n::N8n::new(config)?))
}
