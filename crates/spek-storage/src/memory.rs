use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use spek_core::{Listing, Query, QueryId, SearchParams};
use tokio::sync::Mutex;

use crate::{QueryRegistry, ResultLedger, StorageError};

/// Process-local store for tests and `serve --memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    queries: BTreeMap<QueryId, Query>,
    ledger: HashMap<QueryId, Vec<Listing>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger rows for `query_id` in insertion order.
    pub async fn entries(&self, query_id: &QueryId) -> Vec<Listing> {
        let state = self.state.lock().await;
        state.ledger.get(query_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl QueryRegistry for MemoryStore {
    async fn create(&self, params: SearchParams) -> Result<Query, StorageError> {
        let query = Query::new(params);
        let mut state = self.state.lock().await;
        state.queries.insert(query.id.clone(), query.clone());
        Ok(query)
    }

    async fn get(&self, id: &QueryId) -> Result<Query, StorageError> {
        let state = self.state.lock().await;
        state
            .queries
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn list(&self) -> Result<Vec<Query>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.queries.values().cloned().collect())
    }

    async fn delete(&self, id: &QueryId) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.ledger.remove(id);
        state.queries.remove(id);
        Ok(())
    }
}

#[async_trait]
impl ResultLedger for MemoryStore {
    async fn announced(&self, query_id: &QueryId) -> Result<HashSet<String>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .get(query_id)
            .map(|rows| rows.iter().map(|l| l.id.clone()).collect())
            .unwrap_or_default())
    }

    async fn mark_announced(
        &self,
        query_id: &QueryId,
        listings: &[Listing],
    ) -> Result<Vec<String>, StorageError> {
        let mut state = self.state.lock().await;
        // Mirrors the foreign key on query_result.query_id.
        if !state.queries.contains_key(query_id) {
            return Err(StorageError::NotFound(query_id.clone()));
        }
        let rows = state.ledger.entry(query_id.clone()).or_default();
        let mut seen: HashSet<String> = rows.iter().map(|l| l.id.clone()).collect();
        let mut inserted = Vec::new();
        for listing in listings {
            if seen.insert(listing.id.clone()) {
                rows.push(listing.clone());
                inserted.push(listing.id.clone());
            }
        }
        Ok(inserted)
    }
}
