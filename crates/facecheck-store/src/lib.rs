//! facecheck-store — Embedding store backends.
//!
//! A local SQLite file, a hosted PostgREST/Supabase table, and an
//! in-memory store. [`Store`] picks one at runtime.

pub mod memory;
pub mod rest;
pub mod sqlite;

pub use memory::MemoryStore;
pub use rest::{RestConfig, RestStore, RestStoreError};
pub use sqlite::{SqliteStore, SqliteStoreError};

use async_trait::async_trait;
use facecheck_core::{Embedding, EmbeddingStore, StoredRecord};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] SqliteStoreError),
    #[error(transparent)]
    Rest(#[from] RestStoreError),
}

/// Backend chosen from configuration.
pub enum Store {
    Sqlite(SqliteStore),
    Rest(RestStore),
    Memory(MemoryStore),
}

impl Store {
    /// Number of stored records. SQLite counts in the database; the other
    /// backends have no cheaper way than listing.
    pub async fn count(&self) -> Result<usize, StoreError> {
        match self {
            Store::Sqlite(s) => Ok(s.count().await?),
            Store::Rest(s) => Ok(s.list_all().await?.len()),
            Store::Memory(s) => Ok(s.len()),
        }
    }
}

#[async_trait]
impl EmbeddingStore for Store {
    type Error = StoreError;

    fn backend(&self) -> &'static str {
        match self {
            Store::Sqlite(s) => s.backend(),
            Store::Rest(s) => s.backend(),
            Store::Memory(s) => s.backend(),
        }
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        match self {
            Store::Sqlite(s) => Ok(s.list_all().await?),
            Store::Rest(s) => Ok(s.list_all().await?),
            Store::Memory(s) => match s.list_all().await {
                Ok(records) => Ok(records),
                Err(never) => match never {},
            },
        }
    }

    async fn append(&self, embedding: Embedding) -> Result<StoredRecord, StoreError> {
        match self {
            Store::Sqlite(s) => Ok(s.append(embedding).await?),
            Store::Rest(s) => Ok(s.append(embedding).await?),
            Store::Memory(s) => match s.append(embedding).await {
                Ok(record) => Ok(record),
                Err(never) => match never {},
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_reaches_backend() {
        let store = Store::Sqlite(SqliteStore::open_in_memory().await.unwrap());
        assert_eq!(store.backend(), "sqlite");
        store.append(Embedding::new(vec![1.0, 2.0])).await.unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);

        let store = Store::Memory(MemoryStore::new());
        assert_eq!(store.backend(), "memory");
        assert!(store.list_all().await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
