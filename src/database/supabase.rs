//! Supabase adapter over the PostgREST interface.
//!
//! `query` calls the `execute_sql` RPC function, which must exist in the
//! project. Record operations use the table endpoints.
//!
//! Transactions are **not atomic**: statements issued on a transaction are
//! buffered and replayed one by one through `execute_sql` on commit. A
//! failure part-way through leaves the earlier statements applied. Rollback
//! only discards the buffer.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::query_builder::quote_ident;
use super::{ConnectionState, DatabaseConfig, DatabaseProvider, Row, SqlValue, Transaction};
use crate::config::{required, validated, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceError, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "supabase";
const HEALTH_TABLE: &str = "_health_check";

#[derive(Debug, Clone)]
struct Rest {
    http: HttpTransport,
    base: String,
    anon_key: String,
}

impl Rest {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .client()
            .request(method, format!("{}/rest/v1/{}", self.base, path))
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }

    async fn execute_sql(&self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        let body = json!({
            "query": sql,
            "params": params.iter().map(SqlValue::to_json).collect::<Vec<_>>(),
        });
        let value: Value = self
            .http
            .send_json(
                self.request(Method::POST, "rpc/execute_sql").json(&body),
                ErrorKind::QueryFailed,
                "Query failed",
            )
            .await?;
        rows_from(value)
    }

    /// Any answer other than an auth failure or a server error means the
    /// project is reachable; the probe table does not have to exist.
    async fn probe(&self) -> ServiceResult<()> {
        let response = self
            .request(Method::GET, HEALTH_TABLE)
            .query(&[("select", "*"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| {
                ServiceError::provider_call(ErrorDomain::Database, "Failed to connect to Supabase")
                    .with_cause(e)
            })?;
        let status = response.status();
        if status.is_server_error()
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            return Err(ServiceError::provider_call(
                ErrorDomain::Database,
                format!("Failed to connect to Supabase: HTTP {}", status.as_u16()),
            ));
        }
        Ok(())
    }
}

/// Supabase database adapter.
#[derive(Debug)]
pub struct SupabaseDatabase {
    rest: Rest,
    state: RwLock<ConnectionState>,
}

impl SupabaseDatabase {
    pub fn new(config: &DatabaseConfig) -> ServiceResult<Self> {
        validated(config, ErrorDomain::Database)?;
        let url = required(&config.url, "url", ErrorDomain::Database, PROVIDER)?;
        let anon_key = required(&config.anon_key, "anon_key", ErrorDomain::Database, PROVIDER)?;
        Ok(Self {
            rest: Rest {
                http: HttpTransport::new(ErrorDomain::Database, PROVIDER, config.timeout())?,
                base: base_url(url),
                anon_key: anon_key.to_string(),
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

    async fn write_rows(&self, request: RequestBuilder, context: &str) -> ServiceResult<Vec<Row>> {
        let value: Value = self
            .rest
            .http
            .send_json(
                request.header("Prefer", "return=representation"),
                ErrorKind::QueryFailed,
                context,
            )
            .await?;
        rows_from(value)
    }
}

impl Provider for SupabaseDatabase {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Database
    }
}

#[async_trait]
impl DatabaseProvider for SupabaseDatabase {
    async fn connect(&self) -> ServiceResult<()> {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Connected {
            return Ok(());
        }
        self.rest.probe().await?;
        *state = ConnectionState::Connected;
        tracing::info!(provider = PROVIDER, url = %self.rest.base, "connected");
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

    async fn query(&self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        self.ensure_connected().await?;
        self.rest.execute_sql(sql, params).await
    }

    async fn begin(&self) -> ServiceResult<Box<dyn Transaction>> {
        self.ensure_connected().await?;
        tracing::warn!(
            provider = PROVIDER,
            "transaction statements are replayed on commit without atomicity"
        );
        Ok(Box::new(SupabaseTransaction {
            rest: self.rest.clone(),
            buffered: Vec::new(),
        }))
    }

    async fn health_check(&self) -> bool {
        self.ensure_connected().await.is_ok() && self.rest.probe().await.is_ok()
    }

    async fn find_records(&self, collection: &str, filters: &Row) -> ServiceResult<Vec<Row>> {
        self.ensure_connected().await?;
        quote_ident(collection)?;
        let mut query: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        for (column, value) in filters {
            quote_ident(column)?;
            let condition = match value {
                Value::Null => "is.null".to_string(),
                other => format!("eq.{}", filter_text(other)),
            };
            query.push((column.clone(), condition));
        }
        let value: Value = self
            .rest
            .http
            .send_json(
                self.rest.request(Method::GET, collection).query(&query),
                ErrorKind::QueryFailed,
                "Failed to fetch data",
            )
            .await?;
        rows_from(value)
    }

    async fn insert_record(&self, collection: &str, data: Row) -> ServiceResult<Row> {
        self.ensure_connected().await?;
        quote_ident(collection)?;
        let request = self.rest.request(Method::POST, collection).json(&data);
        self.write_rows(request, "Failed to insert record")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::query_failed("Failed to insert record: no row returned"))
    }

    async fn update_record(&self, collection: &str, id: &str, data: Row) -> ServiceResult<Row> {
        self.ensure_connected().await?;
        quote_ident(collection)?;
        let request = self
            .rest
            .request(Method::PATCH, collection)
            .query(&[("id", format!("eq.{}", id))])
            .json(&data);
        self.write_rows(request, "Failed to update record")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ServiceError::query_failed(format!("no {} record with id {}", collection, id))
            })
    }

    async fn delete_record(&self, collection: &str, id: &str) -> ServiceResult<()> {
        self.ensure_connected().await?;
        quote_ident(collection)?;
        self.rest
            .http
            .send_empty(
                self.rest
                    .request(Method::DELETE, collection)
                    .query(&[("id", format!("eq.{}", id))]),
                ErrorKind::QueryFailed,
                "Failed to delete record",
            )
            .await
    }
}

struct SupabaseTransaction {
    rest: Rest,
    buffered: Vec<(String, Vec<SqlValue>)>,
}

#[async_trait]
impl Transaction for SupabaseTransaction {
    /// Buffers the statement; it runs on commit and yields no rows now.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        self.buffered.push((sql.to_string(), params.to_vec()));
        Ok(Vec::new())
    }

    async fn commit(self: Box<Self>) -> ServiceResult<()> {
        let total = self.buffered.len();
        for (applied, (sql, params)) in self.buffered.iter().enumerate() {
            if let Err(e) = self.rest.execute_sql(sql, params).await {
                tracing::warn!(
                    provider = PROVIDER,
                    applied,
                    total,
                    "buffered replay stopped; earlier statements remain applied"
                );
                return Err(e);
            }
        }
        tracing::debug!(provider = PROVIDER, total, "buffered statements replayed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ServiceResult<()> {
        tracing::debug!(provider = PROVIDER, discarded = self.buffered.len(), "buffer discarded");
        Ok(())
    }
}

fn filter_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rows_from(value: Value) -> ServiceResult<Vec<Row>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(ServiceError::query_failed(format!(
                    "expected row objects, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(ServiceError::query_failed(format!(
            "expected row objects, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: Some(url.to_string()),
            anon_key: Some("anon".to_string()),
            ..Default::default()
        }
    }

    async fn connected(server: &MockServer) -> SupabaseDatabase {
        Mock::given(method("GET"))
            .and(path("/rest/v1/_health_check"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        let db = SupabaseDatabase::new(&config(&server.uri())).unwrap();
        db.connect().await.unwrap();
        db
    }

    #[test]
    fn test_new_requires_url_and_key() {
        let err = SupabaseDatabase::new(&DatabaseConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_query_before_connect() {
        let db = SupabaseDatabase::new(&config("http://127.0.0.1:1")).unwrap();
        let err = db.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/_health_check"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let db = SupabaseDatabase::new(&config(&server.uri())).unwrap();
        let err = db.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderCallFailed);
        assert_eq!(db.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_query_calls_execute_sql() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/execute_sql"))
            .and(header("apikey", "anon"))
            .and(body_json(json!({"query": "SELECT $1::int AS n", "params": [1]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"n": 1}])))
            .mount(&server)
            .await;

        let rows = db
            .query("SELECT $1::int AS n", &[SqlValue::Integer(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], 1);
    }

    #[tokio::test]
    async fn test_query_failure_is_wrapped() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/execute_sql"))
            .respond_with(ResponseTemplate::new(400).set_body_string("syntax error"))
            .mount(&server)
            .await;

        let err = db.query("SELEC", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryFailed);
        assert!(err.cause().unwrap().to_string().contains("syntax error"));
    }

    #[tokio::test]
    async fn test_transaction_replays_on_commit_only() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/execute_sql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let mut tx = db.begin().await.ok().unwrap();
        tx.query("INSERT INTO a VALUES (1)", &[]).await.unwrap();
        tx.query("INSERT INTO a VALUES (2)", &[]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.ok().unwrap();
        tx.query("INSERT INTO a VALUES (3)", &[]).await.unwrap();
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_records_uses_eq_filters() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/contacts"))
            .and(query_param("status", "eq.new"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "status": "new"}])),
            )
            .mount(&server)
            .await;

        let mut filters = Row::new();
        filters.insert("status".to_string(), json!("new"));
        let rows = db.find_records("contacts", &filters).await.unwrap();
        assert_eq!(rows[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_find_records_keeps_blank_and_null_filters() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .and(query_param("status", "eq."))
            .and(query_param("deleted_at", "is.null"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 3}])))
            .expect(1)
            .mount(&server)
            .await;

        let mut filters = Row::new();
        filters.insert("status".to_string(), json!(""));
        filters.insert("deleted_at".to_string(), Value::Null);
        let rows = db.find_records("users", &filters).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_requires_connection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/_health_check"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let db = SupabaseDatabase::new(&config(&server.uri())).unwrap();
        assert!(!db.health_check().await);
        db.connect().await.unwrap();
        assert!(db.health_check().await);
        db.disconnect().await.unwrap();
        assert!(!db.health_check().await);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/contacts"))
            .and(query_param("id", "eq.9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let mut data = Row::new();
        data.insert("status".to_string(), json!("done"));
        let err = db.update_record("contacts", "9", data).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryFailed);
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let server = MockServer::start().await;
        let db = connected(&server).await;
        db.disconnect().await.unwrap();
        db.disconnect().await.unwrap();
        assert_eq!(db.state().await, ConnectionState::Disconnected);
    }
}
