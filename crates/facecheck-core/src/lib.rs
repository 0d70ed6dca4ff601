//! facecheck-core — Face embedding extraction and match decisions.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both through
//! ONNX Runtime, and decides matches by Euclidean distance against a
//! fixed threshold.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use embedder::{FaceEmbedder, ModelPaths};
pub use matcher::{evaluate, evaluate_nearest, MatchError, MatchOutcome, MatchStrategy};
pub use provider::{EmbeddingProvider, EmbeddingStore, ProviderError};
pub use recognizer::ARCFACE_EMBEDDING_DIM;
pub use types::{BoundingBox, Detection, Embedding, StoredRecord};
