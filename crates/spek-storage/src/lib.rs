//! Durable state for spekkoper: the registry of saved queries and the ledger of
//! listings already announced per query.

use std::collections::HashSet;

use async_trait::async_trait;
use spek_core::{Listing, Query, QueryId, SearchParams};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "spek-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("query {0} not found")]
    NotFound(QueryId),
    #[error("{column} value {value} does not fit the column")]
    OutOfRange { column: &'static str, value: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait QueryRegistry: Send + Sync {
    /// Assigns a fresh id and persists the query.
    async fn create(&self, params: SearchParams) -> Result<Query, StorageError>;

    async fn get(&self, id: &QueryId) -> Result<Query, StorageError>;

    async fn list(&self) -> Result<Vec<Query>, StorageError>;

    /// Removes the query's ledger entries, then the query. Unknown ids are a no-op.
    async fn delete(&self, id: &QueryId) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Listing ids already announced for `query_id`.
    async fn announced(&self, query_id: &QueryId) -> Result<HashSet<String>, StorageError>;

    /// Records every listing in a single transaction and returns the ids that
    /// were inserted. Ids already present are skipped; any other failure rolls
    /// back the whole batch.
    async fn mark_announced(
        &self,
        query_id: &QueryId,
        listings: &[Listing],
    ) -> Result<Vec<String>, StorageError>;
}
