//! Cloud Firestore adapter over the REST API.
//!
//! Documents map to records: the document id is exposed as the `id` field and
//! typed Firestore values are converted to and from plain JSON. SQL is not
//! supported. Transactions use the `beginTransaction`, `commit` and
//! `rollback` endpoints but cannot carry statements: the handle's `query` is
//! unsupported and record operations do not join the transaction.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use super::{ConnectionState, DatabaseConfig, DatabaseProvider, Row, SqlValue, Transaction};
use crate::config::{required, validated, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceError, ServiceResult};
use crate::http::{base_url, path_segment, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "firebase";
const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com/v1";
const HEALTH_COLLECTION: &str = "_health_check";

#[derive(Debug, Clone)]
struct Rest {
    http: HttpTransport,
    /// `{base}/projects/{project}/databases/(default)/documents`
    root: String,
    api_key: String,
}

impl Rest {
    fn request(&self, method: Method, suffix: &str) -> RequestBuilder {
        self.http
            .client()
            .request(method, format!("{}{}", self.root, suffix))
            .query(&[("key", &self.api_key)])
    }

    async fn call(&self, request: RequestBuilder, context: &str) -> ServiceResult<Value> {
        self.http
            .send_json(request, ErrorKind::QueryFailed, context)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl Document {
    fn into_row(self) -> Row {
        let mut row = Row::new();
        let id = self.name.rsplit('/').next().unwrap_or_default().to_string();
        row.insert("id".to_string(), Value::String(id));
        for (key, value) in self.fields {
            row.insert(key, decode_value(value));
        }
        row
    }
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct BeginResponse {
    transaction: String,
}

/// Firestore database adapter.
#[derive(Debug)]
pub struct FirestoreDatabase {
    rest: Rest,
    state: RwLock<ConnectionState>,
}

impl FirestoreDatabase {
    pub fn new(config: &DatabaseConfig) -> ServiceResult<Self> {
        validated(config, ErrorDomain::Database)?;
        let project = required(&config.project_id, "project_id", ErrorDomain::Database, PROVIDER)?;
        let api_key = required(&config.api_key, "api_key", ErrorDomain::Database, PROVIDER)?;
        let base = base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));
        Ok(Self {
            rest: Rest {
                http: HttpTransport::new(ErrorDomain::Database, PROVIDER, config.timeout())?,
                root: format!("{}/projects/{}/databases/(default)/documents", base, project),
                api_key: api_key.to_string(),
            },
            state: RwLock::new(ConnectionState::Disconnected),
        })
    }

    async fn ensure_connected(&self) -> ServiceResult<()> {
        match *self.state.read().await {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => {
                Err(ServiceError::not_connected(ErrorDomain::Database, PROVIDER))
            }
        }
    }

    async fn probe(&self) -> ServiceResult<()> {
        let response = self
            .rest
            .request(Method::GET, &format!("/{}", HEALTH_COLLECTION))
            .query(&[("pageSize", "1")])
            .send()
            .await
            .map_err(|e| {
                ServiceError::provider_call(ErrorDomain::Database, "Failed to connect to Firestore")
                    .with_cause(e)
            })?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(ServiceError::provider_call(
            ErrorDomain::Database,
            format!("Failed to connect to Firestore: HTTP {}", status.as_u16()),
        ))
    }
}

impl Provider for FirestoreDatabase {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Database
    }

    fn unsupported_operations(&self) -> &[&'static str] {
        &["query"]
    }
}

#[async_trait]
impl DatabaseProvider for FirestoreDatabase {
    async fn connect(&self) -> ServiceResult<()> {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Connected {
            return Ok(());
        }
        self.probe().await?;
        *state = ConnectionState::Connected;
        tracing::info!(provider = PROVIDER, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> ServiceResult<()> {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Disconnected;
            tracing::info!(provider = PROVIDER, "disconnected");
        }
        Ok(())
    }

    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn query(&self, _sql: &str, _params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        Err(self.unsupported("query"))
    }

    async fn begin(&self) -> ServiceResult<Box<dyn Transaction>> {
        self.ensure_connected().await?;
        let value = self
            .rest
            .call(
                self.rest
                    .request(Method::POST, ":beginTransaction")
                    .json(&json!({})),
                "Failed to begin transaction",
            )
            .await?;
        let begun: BeginResponse = decode_body(value)?;
        tracing::debug!(provider = PROVIDER, "transaction started");
        Ok(Box::new(FirestoreTransaction {
            rest: self.rest.clone(),
            id: begun.transaction,
        }))
    }

    async fn health_check(&self) -> bool {
        self.ensure_connected().await.is_ok() && self.probe().await.is_ok()
    }

    async fn find_records(&self, collection: &str, filters: &Row) -> ServiceResult<Vec<Row>> {
        self.ensure_connected().await?;
        let collection = segment(collection)?;

        let predicates: Vec<Value> = filters
            .iter()
            .map(|(field, value)| match value {
                Value::Null => json!({
                    "unaryFilter": {
                        "field": {"fieldPath": field},
                        "op": "IS_NULL",
                    }
                }),
                other => json!({
                    "fieldFilter": {
                        "field": {"fieldPath": field},
                        "op": "EQUAL",
                        "value": encode_value(other),
                    }
                }),
            })
            .collect();
        let mut structured = json!({"from": [{"collectionId": collection}]});
        match predicates.len() {
            0 => {}
            1 => structured["where"] = predicates[0].clone(),
            _ => {
                structured["where"] =
                    json!({"compositeFilter": {"op": "AND", "filters": predicates}})
            }
        }

        let value = self
            .rest
            .call(
                self.rest
                    .request(Method::POST, ":runQuery")
                    .json(&json!({"structuredQuery": structured})),
                "Failed to fetch data",
            )
            .await?;
        let items: Vec<RunQueryItem> = decode_body(value)?;
        Ok(items
            .into_iter()
            .filter_map(|item| item.document.map(Document::into_row))
            .collect())
    }

    async fn insert_record(&self, collection: &str, data: Row) -> ServiceResult<Row> {
        self.ensure_connected().await?;
        let collection = segment(collection)?;
        let value = self
            .rest
            .call(
                self.rest
                    .request(Method::POST, &format!("/{}", collection))
                    .json(&json!({"fields": encode_fields(&data)})),
                "Failed to insert record",
            )
            .await?;
        decode_body::<Document>(value).map(Document::into_row)
    }

    async fn update_record(&self, collection: &str, id: &str, data: Row) -> ServiceResult<Row> {
        self.ensure_connected().await?;
        let path = format!("/{}/{}", segment(collection)?, segment(id)?);
        let mut mask: Vec<(&str, &str)> = data
            .keys()
            .map(|k| ("updateMask.fieldPaths", k.as_str()))
            .collect();
        mask.push(("currentDocument.exists", "true"));

        let value = self
            .rest
            .call(
                self.rest
                    .request(Method::PATCH, &path)
                    .query(&mask)
                    .json(&json!({"fields": encode_fields(&data)})),
                "Failed to update record",
            )
            .await?;
        decode_body::<Document>(value).map(Document::into_row)
    }

    async fn delete_record(&self, collection: &str, id: &str) -> ServiceResult<()> {
        self.ensure_connected().await?;
        let path = format!("/{}/{}", segment(collection)?, segment(id)?);
        self.rest
            .http
            .send_empty(
                self.rest.request(Method::DELETE, &path),
                ErrorKind::QueryFailed,
                "Failed to delete record",
            )
            .await
    }
}

struct FirestoreTransaction {
    rest: Rest,
    id: String,
}

#[async_trait]
impl Transaction for FirestoreTransaction {
    async fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        Err(ServiceError::unsupported(ErrorDomain::Database, PROVIDER, "query"))
    }

    async fn commit(self: Box<Self>) -> ServiceResult<()> {
        self.rest
            .call(
                self.rest
                    .request(Method::POST, ":commit")
                    .json(&json!({"transaction": self.id, "writes": []})),
                "Failed to commit transaction",
            )
            .await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ServiceResult<()> {
        self.rest
            .call(
                self.rest
                    .request(Method::POST, ":rollback")
                    .json(&json!({"transaction": self.id})),
                "Failed to roll back transaction",
            )
            .await?;
        Ok(())
    }
}

/// A single path segment: non-empty and free of URL delimiters.
fn segment(name: &str) -> ServiceResult<&str> {
    path_segment(name, ErrorDomain::Database)
}

fn decode_body<T: serde::de::DeserializeOwned>(value: Value) -> ServiceResult<T> {
    serde_json::from_value(value).map_err(|e| {
        ServiceError::query_failed("unexpected Firestore response").with_cause(e)
    })
}

fn encode_fields(data: &Row) -> Value {
    Value::Object(
        data.iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({"nullValue": null}),
        Value::Bool(b) => json!({"booleanValue": b}),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({"integerValue": i.to_string()}),
            None => json!({"doubleValue": n.as_f64()}),
        },
        Value::String(s) => json!({"stringValue": s}),
        Value::Array(items) => {
            json!({"arrayValue": {"values": items.iter().map(encode_value).collect::<Vec<_>>()}})
        }
        Value::Object(fields) => json!({"mapValue": {"fields": encode_fields(fields)}}),
    }
}

fn decode_value(value: Value) -> Value {
    let Value::Object(mut typed) = value else {
        return value;
    };
    let Some((kind, inner)) = typed.iter_mut().next().map(|(k, v)| (k.clone(), v.take())) else {
        return Value::Null;
    };
    match (kind.as_str(), inner) {
        ("nullValue", _) => Value::Null,
        ("integerValue", Value::String(s)) => s
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(s)),
        ("arrayValue", Value::Object(mut array)) => match array.remove("values") {
            Some(Value::Array(items)) => {
                Value::Array(items.into_iter().map(decode_value).collect())
            }
            _ => Value::Array(Vec::new()),
        },
        ("mapValue", Value::Object(mut map)) => match map.remove("fields") {
            Some(Value::Object(fields)) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, decode_value(v)))
                    .collect(),
            ),
            _ => Value::Object(Map::new()),
        },
        (_, inner) => inner,
    }
}
