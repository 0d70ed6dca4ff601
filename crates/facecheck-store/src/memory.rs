//! In-process store, mainly for tests and dry runs.

use async_trait::async_trait;
use facecheck_core::{Embedding, EmbeddingStore, StoredRecord};
use std::convert::Infallible;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with the given embeddings.
    pub fn with_embeddings(embeddings: impl IntoIterator<Item = Embedding>) -> Self {
        let store = Self::new();
        {
            let mut records = store.lock();
            for embedding in embeddings {
                let id = format!("mem-{}", records.len() + 1);
                records.push(StoredRecord {
                    id,
                    embedding,
                    created_at: None,
                });
            }
        }
        store
    }

    /// Copy of everything stored so far.
    pub fn snapshot(&self) -> Vec<StoredRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredRecord>> {
        // A panic while holding the lock cannot leave a half-written record.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EmbeddingStore for MemoryStore {
    type Error = Infallible;

    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, Infallible> {
        Ok(self.snapshot())
    }

    async fn append(&self, embedding: Embedding) -> Result<StoredRecord, Infallible> {
        let mut records = self.lock();
        let record = StoredRecord {
            id: format!("mem-{}", records.len() + 1),
            embedding,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        records.push(record.clone());
        Ok(record)
    }
}
