//! PostgreSQL adapter backed by a `deadpool-postgres` pool.
//!
//! The pool is created by `connect()` and closed by `disconnect()`. Every
//! query checks a connection out of the pool; a transaction keeps one
//! connection for its whole lifetime and issues `BEGIN`, its statements and
//! `COMMIT`/`ROLLBACK` on it.
//!
//! Parameters are converted to the types the server reports for the prepared
//! statement, so a text id can be bound to an integer or uuid column.
//! Result columns are decoded into JSON; `numeric` and other types without a
//! JSON mapping decode as `null` unless cast to text in SQL.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Client, Config, Pool, Runtime, SslMode};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use uuid::Uuid;

use super::query_builder::{delete_statement, select_matching, InsertBuilder, UpdateBuilder};
use super::{ConnectionState, DatabaseConfig, DatabaseProvider, Row, SqlValue, Transaction};
use crate::config::{required, validated};
use crate::error::{Capability, ErrorDomain, ServiceError, ServiceResult};
use crate::provider::Provider;

const PROVIDER: &str = "postgresql";

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Pooled PostgreSQL adapter.
pub struct PostgresDatabase {
    config: Config,
    max_connections: usize,
    idle_timeout: Duration,
    connection_timeout: Duration,
    pool: RwLock<Option<Pool>>,
}

impl fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("dbname", &self.config.dbname)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl PostgresDatabase {
    /// Validate the configuration. No connection is opened.
    pub fn new(config: &DatabaseConfig) -> ServiceResult<Self> {
        validated(config, ErrorDomain::Database)?;
        if config.ssl.unwrap_or(false) {
            return Err(ServiceError::invalid_config(
                ErrorDomain::Database,
                "postgresql: TLS connections are not available in this build, set ssl = false",
            ));
        }

        let mut pg = Config::new();
        pg.host = Some(
            config
                .host
                .clone()
                .unwrap_or_else(|| "localhost".to_string()),
        );
        pg.port = Some(config.port.unwrap_or(5432));
        let dbname = required(&config.database, "database", ErrorDomain::Database, PROVIDER)?;
        let user = required(&config.user, "user", ErrorDomain::Database, PROVIDER)?;
        pg.dbname = Some(dbname.to_string());
        pg.user = Some(user.to_string());
        pg.password = config.password.clone();
        pg.ssl_mode = Some(SslMode::Disable);
        pg.connect_timeout = Some(config.connection_timeout());

        tracing::debug!(
            provider = PROVIDER,
            host = ?pg.host,
            dbname = ?pg.dbname,
            "postgresql adapter configured"
        );

        Ok(Self {
            config: pg,
            max_connections: config.max_connections(),
            idle_timeout: config.idle_timeout(),
            connection_timeout: config.connection_timeout(),
            pool: RwLock::new(None),
        })
    }

    fn create_pool(&self) -> ServiceResult<Pool> {
        self.config
            .builder(NoTls)
            .map_err(|e| {
                ServiceError::invalid_config(ErrorDomain::Database, "Failed to create pool builder")
                    .with_cause(e)
            })?
            .max_size(self.max_connections)
            .create_timeout(Some(self.connection_timeout))
            .wait_timeout(Some(self.connection_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                ServiceError::provider_call(ErrorDomain::Database, "Failed to create PostgreSQL pool")
                    .with_cause(e)
            })
    }

    async fn pool(&self) -> ServiceResult<Pool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| ServiceError::not_connected(ErrorDomain::Database, PROVIDER))
    }

    async fn client(&self) -> ServiceResult<Client> {
        let pool = self.pool().await?;
        pool.get().await.map_err(|e| {
            ServiceError::provider_call(ErrorDomain::Database, "Failed to acquire connection")
                .with_cause(e)
        })
    }

    async fn first_row(&self, sql: &str, params: &[SqlValue], missing: String) -> ServiceResult<Row> {
        self.query(sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::query_failed(missing))
    }
}

impl Provider for PostgresDatabase {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Database
    }
}

#[async_trait]
impl DatabaseProvider for PostgresDatabase {
    async fn connect(&self) -> ServiceResult<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let pool = self.create_pool()?;
        let client = pool.get().await.map_err(|e| {
            ServiceError::provider_call(ErrorDomain::Database, "Failed to connect to PostgreSQL")
                .with_cause(e)
        })?;
        client.simple_query("SELECT 1").await.map_err(|e| {
            ServiceError::provider_call(ErrorDomain::Database, "Failed to connect to PostgreSQL")
                .with_cause(e)
        })?;
        drop(client);

        *slot = Some(pool);
        tracing::info!(provider = PROVIDER, host = ?self.config.host, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> ServiceResult<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close();
            tracing::info!(provider = PROVIDER, "disconnected");
        }
        Ok(())
    }

    async fn state(&self) -> ConnectionState {
        if self.pool.read().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        let client = self.client().await?;
        run(&client, sql, params).await
    }

    async fn begin(&self) -> ServiceResult<Box<dyn Transaction>> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| ServiceError::query_failed("Failed to begin transaction").with_cause(e))?;
        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }

    async fn health_check(&self) -> bool {
        let pool = match self.pool().await {
            Ok(pool) => pool,
            Err(_) => return false,
        };
        let idle = self.idle_timeout;
        pool.retain(|_, metrics| metrics.last_used() < idle);

        match pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(e) => {
                tracing::warn!(provider = PROVIDER, error = %e, "health check failed");
                false
            }
        }
    }

    async fn find_records(&self, collection: &str, filters: &Row) -> ServiceResult<Vec<Row>> {
        let statement = select_matching(collection, filters)?;
        self.query(&statement.sql, &statement.params).await
    }

    async fn insert_record(&self, collection: &str, data: Row) -> ServiceResult<Row> {
        let statement = data
            .into_iter()
            .fold(InsertBuilder::new(collection), |b, (k, v)| b.value(k, v))
            .build()?;
        self.first_row(
            &statement.sql,
            &statement.params,
            format!("insert into {} returned no row", collection),
        )
        .await
    }

    async fn update_record(&self, collection: &str, id: &str, data: Row) -> ServiceResult<Row> {
        let statement = data
            .into_iter()
            .fold(UpdateBuilder::new(collection), |b, (k, v)| b.set(k, v))
            .where_eq("id", id)
            .returning(["*"])
            .build()?;
        self.first_row(
            &statement.sql,
            &statement.params,
            format!("no {} record with id {}", collection, id),
        )
        .await
    }

    async fn delete_record(&self, collection: &str, id: &str) -> ServiceResult<()> {
        let statement = delete_statement(collection, "id", id)?;
        self.query(&statement.sql, &statement.params).await?;
        Ok(())
    }
}

/// A pooled connection with an open transaction.
struct PostgresTransaction {
    client: Option<Client>,
}

impl PostgresTransaction {
    async fn finish(mut self: Box<Self>, command: &'static str) -> ServiceResult<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| ServiceError::not_connected(ErrorDomain::Database, PROVIDER))?;
        client
            .batch_execute(command)
            .await
            .map_err(|e| ServiceError::query_failed(format!("{} failed", command)).with_cause(e))?;
        tracing::debug!(provider = PROVIDER, command, "transaction finished");
        Ok(())
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ServiceError::not_connected(ErrorDomain::Database, PROVIDER))?;
        run(client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> ServiceResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> ServiceResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        tracing::warn!(provider = PROVIDER, "transaction dropped without commit or rollback");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!(provider = PROVIDER, error = %e, "rollback of dropped transaction failed");
                }
            });
        }
    }
}

async fn run(client: &Client, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
    let statement = client
        .prepare_cached(sql)
        .await
        .map_err(|e| ServiceError::query_failed("Query failed").with_cause(e))?;

    let expected = statement.params();
    if expected.len() != params.len() {
        return Err(ServiceError::query_failed(format!(
            "statement expects {} parameters, got {}",
            expected.len(),
            params.len()
        )));
    }

    let bound = expected
        .iter()
        .zip(params)
        .map(|(ty, value)| bind(value, ty))
        .collect::<ServiceResult<Vec<BoxedParam>>>()?;
    let refs: Vec<&(dyn ToSql + Sync)> = bound
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();

    let rows = client
        .query(&statement, &refs)
        .await
        .map_err(|e| ServiceError::query_failed("Query failed").with_cause(e))?;

    rows.iter().map(decode_row).collect()
}

/// Convert a parameter to the Rust type matching the server-side type.
fn bind(value: &SqlValue, ty: &Type) -> ServiceResult<BoxedParam> {
    let mismatch = || ServiceError::query_failed(format!("cannot bind {:?} as {}", value, ty));

    let boxed: BoxedParam = match *ty {
        Type::BOOL => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Text(s) => Some(s.parse::<bool>().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        Type::INT2 => Box::new(
            integer(value)
                .map_err(|_| mismatch())?
                .map(i16::try_from)
                .transpose()
                .map_err(|_| mismatch())?,
        ),
        Type::INT4 => Box::new(
            integer(value)
                .map_err(|_| mismatch())?
                .map(i32::try_from)
                .transpose()
                .map_err(|_| mismatch())?,
        ),
        Type::INT8 => Box::new(integer(value).map_err(|_| mismatch())?),
        Type::FLOAT4 | Type::FLOAT8 => {
            let float = match value {
                SqlValue::Null => None,
                SqlValue::Float(f) => Some(*f),
                SqlValue::Integer(i) => Some(*i as f64),
                SqlValue::Text(s) => Some(s.parse::<f64>().map_err(|_| mismatch())?),
                _ => return Err(mismatch()),
            };
            if *ty == Type::FLOAT4 {
                Box::new(float.map(|f| f as f32))
            } else {
                Box::new(float)
            }
        }
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Box::new(match value {
                SqlValue::Null => None,
                SqlValue::Text(s) => Some(s.clone()),
                SqlValue::Integer(i) => Some(i.to_string()),
                SqlValue::Float(f) => Some(f.to_string()),
                SqlValue::Bool(b) => Some(b.to_string()),
                SqlValue::Timestamp(t) => Some(t.to_rfc3339()),
                SqlValue::Json(v) => Some(v.to_string()),
                SqlValue::TextArray(_) => return Err(mismatch()),
            })
        }
        Type::JSON | Type::JSONB => Box::new(match value {
            SqlValue::Null => None,
            other => Some(other.to_json()),
        }),
        Type::UUID => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(Uuid::parse_str(s).map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        Type::TIMESTAMPTZ => Box::new(timestamp(value).map_err(|_| mismatch())?),
        Type::TIMESTAMP => Box::new(
            timestamp(value)
                .map_err(|_| mismatch())?
                .map(|t| t.naive_utc()),
        ),
        Type::DATE => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::Timestamp(t) => Some(t.date_naive()),
            SqlValue::Text(s) => Some(
                s.parse::<NaiveDate>()
                    .map_err(|_| mismatch())?,
            ),
            _ => return Err(mismatch()),
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => Box::new(match value {
            SqlValue::Null => None,
            SqlValue::TextArray(items) => Some(items.clone()),
            _ => return Err(mismatch()),
        }),
        _ => natural(value),
    };
    Ok(boxed)
}

fn integer(value: &SqlValue) -> Result<Option<i64>, ()> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Integer(i) => Ok(Some(*i)),
        SqlValue::Text(s) => s.trim().parse().map(Some).map_err(|_| ()),
        _ => Err(()),
    }
}

fn timestamp(value: &SqlValue) -> Result<Option<DateTime<Utc>>, ()> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Timestamp(t) => Ok(Some(*t)),
        SqlValue::Text(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| ()),
        _ => Err(()),
    }
}

/// Binding used for server types without a dedicated conversion; the driver
/// reports a mismatch when the types disagree.
fn natural(value: &SqlValue) -> BoxedParam {
    match value {
        SqlValue::Null => Box::new(None::<String>),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::Integer(i) => Box::new(*i),
        SqlValue::Float(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Timestamp(t) => Box::new(*t),
        SqlValue::Json(v) => Box::new(v.clone()),
        SqlValue::TextArray(items) => Box::new(items.clone()),
    }
}

fn decode_row(row: &tokio_postgres::Row) -> ServiceResult<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode(row, idx, column.type_())
            .map_err(|e| ServiceError::query_failed("Failed to decode row").with_cause(e))?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value, tokio_postgres::Error> {
    fn json<T: Into<Value>>(value: Option<T>) -> Value {
        value.map(Into::into).unwrap_or(Value::Null)
    }

    let value = match *ty {
        Type::BOOL => json(row.try_get::<_, Option<bool>>(idx)?),
        Type::INT2 => json(row.try_get::<_, Option<i16>>(idx)?),
        Type::INT4 => json(row.try_get::<_, Option<i32>>(idx)?),
        Type::INT8 => json(row.try_get::<_, Option<i64>>(idx)?),
        Type::FLOAT4 => json(row.try_get::<_, Option<f32>>(idx)?),
        Type::FLOAT8 => json(row.try_get::<_, Option<f64>>(idx)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            json(row.try_get::<_, Option<String>>(idx)?)
        }
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?.unwrap_or(Value::Null),
        Type::UUID => json(row.try_get::<_, Option<Uuid>>(idx)?.map(|u| u.to_string())),
        Type::TIMESTAMPTZ => json(
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|t| t.to_rfc3339()),
        ),
        Type::TIMESTAMP => json(
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        ),
        Type::DATE => json(row.try_get::<_, Option<NaiveDate>>(idx)?.map(|d| d.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            json(row.try_get::<_, Option<Vec<String>>>(idx)?)
        }
        Type::INT4_ARRAY => json(row.try_get::<_, Option<Vec<i32>>>(idx)?),
        Type::INT8_ARRAY => json(row.try_get::<_, Option<Vec<i64>>>(idx)?),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(value) => json(value),
            Err(_) => {
                tracing::debug!(provider = PROVIDER, column = idx, ty = %ty, "no JSON mapping for column type");
                Value::Null
            }
        },
    };
    Ok(value)
}
