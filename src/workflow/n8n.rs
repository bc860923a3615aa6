//! n8n adapter.
//!
//! Workflows are managed through the public REST API (`/api/v1/workflows`,
//! `X-N8N-API-KEY`). Steps map one-to-one to nodes and are chained in order.
//! Execution posts the input to the production webhook
//! `{webhook_url}/webhook/{workflow_id}`, so the workflow must start with a
//! Webhook node whose path is the workflow id.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    Workflow, WorkflowConfig, WorkflowProvider, WorkflowResult, WorkflowStatus, WorkflowStep,
};
use crate::auth::parse_time;
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceError, ServiceResult};
use crate::http::{base_url, path_segment, HttpStatusError, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "n8n";
const PAGE_SIZE: &str = "100";
const NODE_SPACING: i64 = 220;
const STARTED_MESSAGE: &str = "Workflow was started";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct N8nWorkflow {
    id: String,
    name: String,
    #[serde(default)]
    nodes: Vec<N8nNode>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct N8nNode {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowPage {
    #[serde(default)]
    data: Vec<N8nWorkflow>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl From<N8nWorkflow> for Workflow {
    fn from(workflow: N8nWorkflow) -> Self {
        let created_at = parse_time(workflow.created_at.as_deref()).unwrap_or_default();
        Workflow {
            id: workflow.id,
            name: workflow.name,
            steps: workflow
                .nodes
                .into_iter()
                .map(|node| WorkflowStep {
                    id: node.id.unwrap_or(node.name),
                    step_type: node.node_type,
                    config: node.parameters,
                })
                .collect(),
            created_at,
            updated_at: parse_time(workflow.updated_at.as_deref()).unwrap_or(created_at),
        }
    }
}

/// Node list and sequential connections for `steps`. Step ids double as
/// node names.
fn workflow_body(name: &str, steps: &[WorkflowStep]) -> Value {
    let mut position = 0i64;
    let nodes: Vec<Value> = steps
        .iter()
        .map(|step| {
            let node = json!({
                "id": step.id,
                "name": step.id,
                "type": step.step_type,
                "typeVersion": 1,
                "position": [position, 0],
                "parameters": step.config,
            });
            position += NODE_SPACING;
            node
        })
        .collect();

    let mut connections = Map::new();
    for pair in steps.windows(2) {
        connections.insert(
            pair[0].id.clone(),
            json!({"main": [[{"node": pair[1].id, "type": "main", "index": 0}]]}),
        );
    }

    json!({
        "name": name,
        "nodes": nodes,
        "connections": connections,
        "settings": {},
    })
}

/// n8n workflow adapter.
pub struct N8n {
    http: HttpTransport,
    api_url: String,
    webhook_url: String,
    api_key: String,
}

impl fmt::Debug for N8n {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("N8n")
            .field("api_url", &self.api_url)
            .field("webhook_url", &self.webhook_url)
            .finish_non_exhaustive()
    }
}

impl N8n {
    pub fn new(config: &WorkflowConfig) -> ServiceResult<Self> {
        let api_url = required(&config.api_url, "api_url", ErrorDomain::Workflow, PROVIDER)?;
        let api_key = required(&config.api_key, "api_key", ErrorDomain::Workflow, PROVIDER)?;
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Workflow, PROVIDER, config.timeout())?,
            api_url: base_url(api_url),
            webhook_url: base_url(config.webhook_url.as_deref().unwrap_or(api_url)),
            api_key: api_key.to_string(),
        })
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .client()
            .request(method, format!("{}/api/v1/{}", self.api_url, path))
            .header("X-N8N-API-KEY", &self.api_key)
    }

    async fn fetch(&self, request: RequestBuilder, context: &str) -> ServiceResult<Workflow> {
        let workflow: N8nWorkflow = self
            .http
            .send_json(request, ErrorKind::ProviderCallFailed, context)
            .await?;
        Ok(workflow.into())
    }
}

impl Provider for N8n {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Workflow
    }
}

#[async_trait]
impl WorkflowProvider for N8n {
    async fn create_workflow(&self, name: &str, steps: &[WorkflowStep]) -> ServiceResult<Workflow> {
        let request = self
            .api(Method::POST, "workflows")
            .json(&workflow_body(name, steps));
        let workflow = self.fetch(request, "Failed to create workflow").await?;
        tracing::info!(provider = PROVIDER, workflow_id = %workflow.id, "workflow created");
        Ok(workflow)
    }

    async fn execute_workflow(
        &self,
        workflow_id: &str,
        data: &Value,
    ) -> ServiceResult<WorkflowResult> {
        let id = path_segment(workflow_id, ErrorDomain::Workflow)?;
        let context = "Workflow execution failed";
        let response = self
            .http
            .client()
            .post(format!("{}/webhook/{}", self.webhook_url, id))
            .json(data)
            .send()
            .await
            .map_err(|e| ServiceError::provider_call(ErrorDomain::Workflow, context).with_cause(e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let output = serde_json::from_str::<Value>(&body)
            .ok()
            .or_else(|| (!body.is_empty()).then(|| Value::String(body.clone())));

        if status.is_success() {
            let started = output
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                == Some(STARTED_MESSAGE);
            return Ok(WorkflowResult {
                workflow_id: workflow_id.to_string(),
                status: if started {
                    WorkflowStatus::Running
                } else {
                    WorkflowStatus::Success
                },
                output,
                error: None,
            });
        }

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let error = output
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(body);
            tracing::warn!(provider = PROVIDER, workflow_id, error = %error, "workflow run failed");
            return Ok(WorkflowResult {
                workflow_id: workflow_id.to_string(),
                status: WorkflowStatus::Failed,
                output: None,
                error: Some(error),
            });
        }

        Err(
            ServiceError::provider_call(ErrorDomain::Workflow, context).with_cause(HttpStatusError {
                status: status.as_u16(),
                body,
            }),
        )
    }

    async fn get_workflow(&self, workflow_id: &str) -> ServiceResult<Workflow> {
        let id = path_segment(workflow_id, ErrorDomain::Workflow)?;
        self.fetch(
            self.api(Method::GET, &format!("workflows/{}", id)),
            "Failed to fetch workflow",
        )
        .await
    }

    async fn list_workflows(&self) -> ServiceResult<Vec<Workflow>> {
        let mut workflows = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = self
                .api(Method::GET, "workflows")
                .query(&[("limit", PAGE_SIZE)]);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            let page: WorkflowPage = self
                .http
                .send_json(request, ErrorKind::ProviderCallFailed, "Failed to list workflows")
                .await?;
            workflows.extend(page.data.into_iter().map(Workflow::from));
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(workflows),
            }
        }
    }

    async fn delete_workflow(&self, workflow_id: &str) -> ServiceResult<()> {
        let id = path_segment(workflow_id, ErrorDomain::Workflow)?;
        self.http
            .send_empty(
                self.api(Method::DELETE, &format!("workflows/{}", id)),
                ErrorKind::ProviderCallFailed,
                "Failed to delete workflow",
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> WorkflowConfig {
        WorkflowConfig {
            api_url: Some(server.uri()),
            api_key: Some("n8n-key".to_string()),
            ..Default::default()
        }
    }

    fn remote(id: &str) -> Value {
        json!({
            "id": id,
            "name": "Contact intake",
            "active": false,
            "createdAt": "2024-05-01T09:00:00.000Z",
            "updatedAt": "2024-05-02T09:00:00.000Z",
            "nodes": [
                {"id": "hook", "name": "hook", "type": "n8n-nodes-base.webhook", "parameters": {"path": id}},
                {"name": "Notify", "type": "n8n-nodes-base.slack", "parameters": {}}
            ],
            "connections": {}
        })
    }

    #[test]
    fn test_workflow_body_chains_steps() {
        let steps = vec![
            WorkflowStep::new("hook", "n8n-nodes-base.webhook"),
            WorkflowStep::new("notify", "n8n-nodes-base.slack"),
        ];
        let body = workflow_body("Intake", &steps);
        assert_eq!(body["nodes"][1]["position"], json!([220, 0]));
        assert_eq!(body["connections"]["hook"]["main"][0][0]["node"], "notify");
        assert!(body["connections"].get("notify").is_none());
    }

    #[test]
    fn test_new_requires_api_key() {
        let err = N8n::new(&WorkflowConfig {
            api_url: Some("http://n8n".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_create_workflow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/workflows"))
            .and(header("X-N8N-API-KEY", "n8n-key"))
            .and(body_partial_json(json!({"name": "Contact intake", "settings": {}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(remote("wf1")))
            .mount(&server)
            .await;

        let n8n = N8n::new(&config(&server)).unwrap();
        let workflow = n8n
            .create_workflow(
                "Contact intake",
                &[WorkflowStep::new("hook", "n8n-nodes-base.webhook")],
            )
            .await
            .unwrap();
        assert_eq!(workflow.id, "wf1");
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.steps[1].id, "Notify");
        assert!(workflow.updated_at > workflow.created_at);
    }

    #[tokio::test]
    async fn test_list_workflows_follows_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/workflows"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [remote("wf2")],
                "nextCursor": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/workflows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [remote("wf1")],
                "nextCursor": "page2"
            })))
            .mount(&server)
            .await;

        let n8n = N8n::new(&config(&server)).unwrap();
        let ids: Vec<String> = n8n
            .list_workflows()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["wf1".to_string(), "wf2".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_workflow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/wf1"))
            .and(body_json(json!({"email": "ann@example.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ticket": 7})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook/wf2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": "Workflow was started"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook/wf3"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "message": "Error in workflow"
            })))
            .mount(&server)
            .await;

        let n8n = N8n::new(&config(&server)).unwrap();
        let data = json!({"email": "ann@example.com"});

        let done = n8n.execute_workflow("wf1", &data).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Success);
        assert_eq!(done.output, Some(json!({"ticket": 7})));

        let started = n8n.execute_workflow("wf2", &data).await.unwrap();
        assert_eq!(started.status, WorkflowStatus::Running);

        let failed = n8n.execute_workflow("wf3", &data).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Error in workflow"));
    }

    #[tokio::test]
    async fn test_execute_unknown_webhook_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let n8n = N8n::new(&config(&server)).unwrap();
        let err = n8n.execute_workflow("wf9", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderCallFailed);
        assert_eq!(err.domain(), ErrorDomain::Workflow);
    }

    #[tokio::test]
    async fn test_get_and_delete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/workflows/wf1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(remote("wf1")))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/workflows/wf1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(remote("wf1")))
            .expect(1)
            .mount(&server)
            .await;

        let n8n = N8n::new(&config(&server)).unwrap();
        assert_eq!(n8n.get_workflow("wf1").await.unwrap().name, "Contact intake");
        n8n.delete_workflow("wf1").await.unwrap();
        assert!(n8n.get_workflow("../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_dot_ids_never_reach_the_api() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let n8n = N8n::new(&config(&server)).unwrap();
        for id in [".", ".."] {
            let err = n8n.delete_workflow(id).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        }
    }
}
