//! MongoDB adapter.
//!
//! Records are documents; `_id` is exposed as the string field `id`
//! (ObjectIds as hex). SQL is not supported. Transactions open and close a
//! client session (replica set or sharded deployment required) but cannot
//! carry statements: the handle's `query` is unsupported.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, to_document, Bson, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Client, ClientSession, Database};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ConnectionState, DatabaseConfig, DatabaseProvider, Row, SqlValue, Transaction};
use crate::config::{required, validated};
use crate::error::{Capability, ErrorDomain, ServiceError, ServiceResult};
use crate::provider::Provider;

const PROVIDER: &str = "mongodb";

/// MongoDB database adapter.
#[derive(Debug)]
pub struct MongoDatabase {
    uri: String,
    database: String,
    handle: RwLock<Option<(Client, Database)>>,
}

impl MongoDatabase {
    /// Validate the configuration. The client is created by `connect()`.
    pub fn new(config: &DatabaseConfig) -> ServiceResult<Self> {
        validated(config, ErrorDomain::Database)?;
        let uri = required(
            &config.connection_string,
            "connection_string",
            ErrorDomain::Database,
            PROVIDER,
        )?;
        let database = required(&config.database, "database", ErrorDomain::Database, PROVIDER)?;
        Ok(Self {
            uri: uri.to_string(),
            database: database.to_string(),
            handle: RwLock::new(None),
        })
    }

    async fn handle(&self) -> ServiceResult<(Client, Database)> {
        self.handle
            .read()
            .await
            .clone()
            .ok_or_else(|| ServiceError::not_connected(ErrorDomain::Database, PROVIDER))
    }

    async fn database(&self) -> ServiceResult<Database> {
        Ok(self.handle().await?.1)
    }
}

impl Provider for MongoDatabase {
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
impl DatabaseProvider for MongoDatabase {
    async fn connect(&self) -> ServiceResult<()> {
        let mut slot = self.handle.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let client = Client::with_uri_str(&self.uri)
            .await
            .map_err(|e| connect_failed().with_cause(e))?;
        let database = client.database(&self.database);
        database
            .run_command(doc! {"ping": 1})
            .await
            .map_err(|e| connect_failed().with_cause(e))?;

        *slot = Some((client, database));
        tracing::info!(provider = PROVIDER, database = %self.database, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> ServiceResult<()> {
        if let Some((client, _)) = self.handle.write().await.take() {
            client.shutdown().await;
            tracing::info!(provider = PROVIDER, "disconnected");
        }
        Ok(())
    }

    async fn state(&self) -> ConnectionState {
        if self.handle.read().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn query(&self, _sql: &str, _params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        Err(self.unsupported("query"))
    }

    async fn begin(&self) -> ServiceResult<Box<dyn Transaction>> {
        let (client, _) = self.handle().await?;
        let mut session = client
            .start_session()
            .await
            .map_err(|e| ServiceError::query_failed("Failed to start session").with_cause(e))?;
        session
            .start_transaction()
            .await
            .map_err(|e| ServiceError::query_failed("Failed to begin transaction").with_cause(e))?;
        Ok(Box::new(MongoTransaction { session }))
    }

    async fn health_check(&self) -> bool {
        match self.database().await {
            Ok(db) => db.run_command(doc! {"ping": 1}).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn find_records(&self, collection: &str, filters: &Row) -> ServiceResult<Vec<Row>> {
        let db = self.database().await?;
        let filter = to_document(filters)
            .map_err(|e| ServiceError::query_failed("Invalid filter").with_cause(e))?;
        let cursor = db
            .collection::<Document>(collection)
            .find(filter)
            .await
            .map_err(|e| ServiceError::query_failed("Failed to fetch data").with_cause(e))?;
        let documents: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| ServiceError::query_failed("Failed to fetch data").with_cause(e))?;
        Ok(documents.into_iter().map(document_to_row).collect())
    }

    async fn insert_record(&self, collection: &str, data: Row) -> ServiceResult<Row> {
        let db = self.database().await?;
        let document = to_document(&data)
            .map_err(|e| ServiceError::query_failed("Invalid record").with_cause(e))?;
        let inserted = db
            .collection::<Document>(collection)
            .insert_one(document)
            .await
            .map_err(|e| ServiceError::query_failed("Failed to insert record").with_cause(e))?;

        let mut row = data;
        row.insert("id".to_string(), id_value(inserted.inserted_id));
        Ok(row)
    }

    async fn update_record(&self, collection: &str, id: &str, data: Row) -> ServiceResult<Row> {
        let db = self.database().await?;
        let set = to_document(&data)
            .map_err(|e| ServiceError::query_failed("Invalid record").with_cause(e))?;
        let updated = db
            .collection::<Document>(collection)
            .find_one_and_update(id_filter(id), doc! {"$set": set})
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| ServiceError::query_failed("Failed to update record").with_cause(e))?;
        updated.map(document_to_row).ok_or_else(|| {
            ServiceError::query_failed(format!("no {} record with id {}", collection, id))
        })
    }

    async fn delete_record(&self, collection: &str, id: &str) -> ServiceResult<()> {
        let db = self.database().await?;
        db.collection::<Document>(collection)
            .delete_one(id_filter(id))
            .await
            .map_err(|e| ServiceError::query_failed("Failed to delete record").with_cause(e))?;
        Ok(())
    }
}

struct MongoTransaction {
    session: ClientSession,
}

#[async_trait]
impl Transaction for MongoTransaction {
    async fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> ServiceResult<Vec<Row>> {
        Err(ServiceError::unsupported(ErrorDomain::Database, PROVIDER, "query"))
    }

    async fn commit(self: Box<Self>) -> ServiceResult<()> {
        let mut this = self;
        this.session
            .commit_transaction()
            .await
            .map_err(|e| ServiceError::query_failed("Failed to commit transaction").with_cause(e))
    }

    async fn rollback(self: Box<Self>) -> ServiceResult<()> {
        let mut this = self;
        this.session
            .abort_transaction()
            .await
            .map_err(|e| ServiceError::query_failed("Failed to abort transaction").with_cause(e))
    }
}

fn connect_failed() -> ServiceError {
    ServiceError::provider_call(ErrorDomain::Database, "Failed to connect to MongoDB")
}

/// ObjectId-looking ids match as ObjectIds, anything else as a string.
fn id_filter(id: &str) -> Document {
    match ObjectId::parse_str(id) {
        Ok(oid) => doc! {"_id": oid},
        Err(_) => doc! {"_id": id},
    }
}

fn id_value(id: Bson) -> Value {
    match id {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::String(s) => Value::String(s),
        other => other.into_relaxed_extjson(),
    }
}

fn document_to_row(mut document: Document) -> Row {
    let id = document.remove("_id");
    let mut row = match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(row) => row,
        _ => Row::new(),
    };
    if let Some(id) = id {
        row.insert("id".to_string(), id_value(id));
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            connection_string: Some("mongodb://127.0.0.1:27017".to_string()),
            database: Some("site".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_requires_connection_string() {
        let err = MongoDatabase::new(&DatabaseConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.message().contains("connection_string"));
    }

    #[tokio::test]
    async fn test_query_is_unsupported() {
        let db = MongoDatabase::new(&config()).unwrap();
        let err = db.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let db = MongoDatabase::new(&config()).unwrap();
        assert_eq!(db.state().await, ConnectionState::Disconnected);
        let err = db.find_records("contacts", &Row::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(db.begin().await.is_err());
        assert!(!db.health_check().await);
        db.disconnect().await.unwrap();
        db.disconnect().await.unwrap();
    }

    #[test]
    fn test_document_to_row_exposes_id() {
        let oid = ObjectId::new();
        let row = document_to_row(doc! {"_id": oid, "name": "Ann", "visits": 3});
        assert_eq!(row["id"], Value::String(oid.to_hex()));
        assert_eq!(row["name"], "Ann");
        assert_eq!(row["visits"], 3);
        assert!(!row.contains_key("_id"));
    }

    #[test]
    fn test_id_filter() {
        let oid = ObjectId::new();
        assert_eq!(id_filter(&oid.to_hex()), doc! {"_id": oid});
        assert_eq!(id_filter("slug"), doc! {"_id": "slug"});
    }
}
