//! Database capability.
//!
//! Adapters are resolved by name through [`DatabaseServiceFactory`]:
//!
//! | provider     | `query` | transactions                                   |
//! |--------------|---------|------------------------------------------------|
//! | `postgresql` | yes     | pooled connection with BEGIN/COMMIT            |
//! | `supabase`   | RPC     | buffered replay, **not atomic**                |
//! | `firebase`   | no      | begin/commit/rollback only, **no statements**  |
//! | `mongodb`    | no      | session begin/commit/abort, **no statements**  |
//!
//! On `firebase` and `mongodb` the transaction handle's `query` fails with
//! `UnsupportedOperation` and record operations do not run on the session,
//! so a transaction there cannot carry any work.
//!
//! Every adapter starts `Disconnected`; `query`, `begin` and the record
//! operations fail with `NotConnected` until `connect()` succeeds, and
//! `health_check` reports `false`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{Capability, ServiceResult};
use crate::provider::Provider;
use crate::registry::{ProviderTable, ProviderTableBuilder};

pub mod firestore;
#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query_builder;
pub mod supabase;
mod types;

pub use query_builder::{
    fetch_page, Filter, InsertBuilder, Page, PagedQuery, Pagination, SelectBuilder, SortDirection,
    Statement, UpdateBuilder,
};
pub use types::{ConnectionState, DatabaseConfig, Row, SqlValue};

/// Session-scoped handle through which every statement of one unit of work
/// is issued.
///
/// Consumed by `commit` or `rollback`; it cannot be used afterwards.
#[async_trait]
pub trait Transaction: Send {
    /// Run a statement on the transaction's own session.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>>;

    /// Commit the unit of work.
    async fn commit(self: Box<Self>) -> ServiceResult<()>;

    /// Abandon the unit of work.
    async fn rollback(self: Box<Self>) -> ServiceResult<()>;
}

/// Database capability contract.
#[async_trait]
pub trait DatabaseProvider: Provider {
    /// Open the connection or pool. Calling it while connected is a no-op.
    async fn connect(&self) -> ServiceResult<()>;

    /// Release the connection or pool. Calling it while disconnected is a
    /// no-op.
    async fn disconnect(&self) -> ServiceResult<()>;

    /// Current lifecycle state.
    async fn state(&self) -> ConnectionState;

    /// Run a parameterized statement.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> ServiceResult<Vec<Row>>;

    /// Open a transaction. Prefer [`DatabaseProviderExt::transaction`], which
    /// guarantees the handle is committed or rolled back.
    async fn begin(&self) -> ServiceResult<Box<dyn Transaction>>;

    /// Whether the backing store answers. Never fails.
    async fn health_check(&self) -> bool;

    /// Records of `collection` whose fields equal every entry of `filters`.
    async fn find_records(&self, collection: &str, filters: &Row) -> ServiceResult<Vec<Row>>;

    /// Insert a record and return it as stored.
    async fn insert_record(&self, collection: &str, data: Row) -> ServiceResult<Row>;

    /// Update the fields of record `id` present in `data` and return it.
    async fn update_record(&self, collection: &str, id: &str, data: Row) -> ServiceResult<Row>;

    /// Delete record `id`.
    async fn delete_record(&self, collection: &str, id: &str) -> ServiceResult<()>;
}

/// Future returned by a transaction callback.
pub type TxFuture<'t, T> = BoxFuture<'t, ServiceResult<T>>;

/// Scoped transactions for every [`DatabaseProvider`].
///
/// # Example
///
/// ```rust,no_run
/// use servicekit::database::{DatabaseProvider, DatabaseProviderExt, SqlValue};
/// use servicekit::ServiceResult;
///
/// async fn rename(db: &dyn DatabaseProvider, id: i64, name: &str) -> ServiceResult<()> {
///     let name = name.to_string();
///     db.transaction(|tx| {
///         Box::pin(async move {
///             tx.query(
///                 "UPDATE users SET name = $1 WHERE id = $2",
///                 &[SqlValue::from(name), SqlValue::from(id)],
///             )
///             .await?;
///             Ok(())
///         })
///     })
///     .await
/// }
/// ```
#[async_trait]
pub trait DatabaseProviderExt: DatabaseProvider {
    /// Run `work` inside a transaction.
    ///
    /// Commits and returns the callback's value when it succeeds. When it
    /// fails the transaction is rolled back and the callback's error is
    /// returned unchanged; a failing rollback is logged, never returned in
    /// its place.
    async fn transaction<T, F>(&self, work: F) -> ServiceResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Transaction) -> TxFuture<'t, T> + Send,
    {
        let mut tx = self.begin().await?;
        tracing::debug!(provider = self.name(), "transaction started");

        let outcome = work(&mut *tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                tracing::debug!(provider = self.name(), "transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        provider = self.name(),
                        error = %rollback_err,
                        "rollback failed after transaction error"
                    );
                } else {
                    tracing::debug!(provider = self.name(), "transaction rolled back");
                }
                Err(err)
            }
        }
    }
}

impl<P: DatabaseProvider + ?Sized> DatabaseProviderExt for P {}

type DatabaseTable = ProviderTable<dyn DatabaseProvider, DatabaseConfig>;

/// Resolves database provider names to adapters.
///
/// Built-in providers: `supabase`, `postgresql` (feature `postgres`),
/// `firebase`, `mongodb` (feature `mongodb`).
#[derive(Debug)]
pub struct DatabaseServiceFactory {
    table: DatabaseTable,
}

impl DatabaseServiceFactory {
    /// Factory over the built-in providers.
    pub fn new() -> Self {
        Self::from_table(Self::builder().build())
    }

    /// Builder pre-populated with the built-in providers, for adding or
    /// replacing entries before the table is frozen.
    pub fn builder() -> ProviderTableBuilder<dyn DatabaseProvider, DatabaseConfig> {
        let builder = ProviderTableBuilder::new(Capability::Database)
            .with("supabase", build_supabase);
        #[cfg(feature = "postgres")]
        let builder = builder.with("postgresql", build_postgres);
        let builder = builder.with("firebase", build_firestore);
        #[cfg(feature = "mongodb")]
        let builder = builder.with("mongodb", build_mongodb);
        builder
    }

    /// Factory over an explicit table.
    pub fn from_table(table: DatabaseTable) -> Self {
        Self { table }
    }

    /// Construct the adapter registered as `provider`.
    pub fn create_service(
        &self,
        provider: &str,
        config: &DatabaseConfig,
    ) -> ServiceResult<Arc<dyn DatabaseProvider>> {
        self.table.resolve(provider, config)
    }

    /// Registered provider names.
    pub fn providers(&self) -> Vec<&str> {
        self.table.names()
    }
}

impl Default for DatabaseServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn build_supabase(config: &DatabaseConfig) -> ServiceResult<Arc<dyn DatabaseProvider>> {
    Ok(Arc::new(supabase::SupabaseDatabase::new(config)?))
}

#[cfg(feature = "postgres")]
fn build_postgres(config: &DatabaseConfig) -> ServiceResult<Arc<dyn DatabaseProvider>> {
    Ok(Arc::new(postgres::PostgresDatabase::new(config)?))
}

fn build_firestore(config: &DatabaseConfig) -> ServiceResult<Arc<dyn DatabaseProvider>> {
    Ok(Arc::new(firestore::FirestoreDatabase::new(config)?))
}

#[cfg(feature = "mongodb")]
fn build_mongodb(config: &DatabaseConfig) -> ServiceResult<Arc<dyn DatabaseProvider>> {
    Ok(Arc::new(mongo::MongoDatabase::new(config)?))
}
