//! SQLite-backed embedding store.
//!
//! Embeddings are stored as little-endian `f32` blobs alongside their
//! dimensionality so truncated rows are detected on read.

use async_trait::async_trait;
use facecheck_core::{Embedding, EmbeddingStore, StoredRecord};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    descriptor    BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Raw row as read from the `faces` table.
struct FaceRow {
    id: String,
    descriptor: Vec<u8>,
    dim: i64,
    model_version: Option<String>,
    created_at: String,
}

/// Embedding store in a local SQLite file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, SqliteStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Self::init(conn).await
    }

    /// Private database that disappears with the store.
    pub async fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, SqliteStoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<usize, SqliteStoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n as usize)
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    type Error = SqliteStoreError;

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, SqliteStoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, descriptor, dim, model_version, created_at FROM faces ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(FaceRow {
                            id: row.get(0)?,
                            descriptor: row.get(1)?,
                            dim: row.get(2)?,
                            model_version: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(decode_row).collect()
    }

    async fn append(&self, embedding: Embedding) -> Result<StoredRecord, SqliteStoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let blob = encode_descriptor(embedding.values());
        let dim = embedding.dim() as i64;
        let model_version = embedding.model_version().map(str::to_owned);

        {
            let id = id.clone();
            let created_at = created_at.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO faces (id, descriptor, dim, model_version, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![id, blob, dim, model_version, created_at],
                    )?;
                    Ok(())
                })
                .await?;
        }

        tracing::debug!(id = %id, dim, "appended embedding");
        Ok(StoredRecord {
            id,
            embedding,
            created_at: Some(created_at),
        })
    }
}

fn encode_descriptor(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_row(row: FaceRow) -> Result<StoredRecord, SqliteStoreError> {
    let corrupt = |reason: String| SqliteStoreError::Corrupt {
        id: row.id.clone(),
        reason,
    };

    if row.descriptor.len() % 4 != 0 {
        return Err(corrupt(format!("descriptor length {} is not a multiple of 4", row.descriptor.len())));
    }
    let values: Vec<f32> = row
        .descriptor
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    if values.len() as i64 != row.dim {
        return Err(corrupt(format!("declared {} dims, blob holds {}", row.dim, values.len())));
    }

    let embedding = match row.model_version {
        Some(version) => Embedding::with_model_version(values, version),
        None => Embedding::new(values),
    };
    Ok(StoredRecord {
        id: row.id,
        embedding,
        created_at: Some(row.created_at),
    })
}
