//! Seams to the two external collaborators: the embedding provider that
//! turns an image into a face embedding, and the store that holds
//! previously seen embeddings.

use crate::types::{Detection, Embedding, StoredRecord};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Model assets could not be loaded. Retryable on the next request.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Turns an encoded image into at most one face detection.
///
/// Implementations must be idempotent per image. "No face" is `Ok(None)`,
/// never an error.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn detect(&self, image: Vec<u8>) -> Result<Option<Detection>, ProviderError>;
}

/// Append-only collection of previously seen embeddings.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    /// Full scan of every stored record, in insertion order where the backend
    /// preserves one.
    async fn list_all(&self) -> Result<Vec<StoredRecord>, Self::Error>;

    /// Persist a new embedding and return the stored record.
    async fn append(&self, embedding: Embedding) -> Result<StoredRecord, Self::Error>;
}
