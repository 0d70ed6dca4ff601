//! Hosted store over a PostgREST table (the API Supabase exposes).
//!
//! Rows look like `{"id": 7, "descriptor": [...], "created_at": "..."}`.
//! Only `descriptor` is required; a table without `id` gets positional ids
//! (`row-0`, `row-1`, ...). Some clients persist typed arrays as objects
//! keyed by index (`{"0": 0.1, "1": -0.2, ...}`); both shapes are accepted
//! on read.

use async_trait::async_trait;
use facecheck_core::{Embedding, EmbeddingStore, StoredRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestStoreError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Connection settings for a PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    /// Anon or service key, sent as `apikey` and bearer token.
    pub api_key: String,
    pub table: String,
    pub timeout: Duration,
}

pub struct RestStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct RestRow {
    #[serde(default)]
    id: Option<serde_json::Value>,
    descriptor: Descriptor,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Descriptor {
    List(Vec<f32>),
    Indexed(BTreeMap<String, f32>),
}

#[derive(Serialize)]
struct NewRow<'a> {
    descriptor: &'a [f32],
}

impl RestStore {
    pub fn new(config: &RestConfig) -> Result<Self, RestStoreError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let endpoint = format!(
            "{}/rest/v1/{}",
            config.base_url.trim_end_matches('/'),
            config.table
        );
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, &self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn rows(response: reqwest::Response) -> Result<Vec<RestRow>, RestStoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| RestStoreError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl EmbeddingStore for RestStore {
    type Error = RestStoreError;

    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, RestStoreError> {
        let response = self
            .request(reqwest::Method::GET)
            .query(&[("select", "*")])
            .send()
            .await?;
        Self::rows(response)
            .await?
            .into_iter()
            .enumerate()
            .map(|(position, row)| into_record(position, row))
            .collect()
    }

    async fn append(&self, embedding: Embedding) -> Result<StoredRecord, RestStoreError> {
        let response = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&[NewRow {
                descriptor: embedding.values(),
            }])
            .send()
            .await?;

        let row = Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RestStoreError::Malformed("insert returned no rows".into()))?;

        // Keep the caller's embedding (and its model version); the server
        // only contributes the surrogate key and timestamp.
        Ok(StoredRecord {
            id: row.id.map_or_else(|| "inserted".to_string(), id_string),
            embedding,
            created_at: row.created_at,
        })
    }
}

fn id_string(id: serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn into_record(position: usize, row: RestRow) -> Result<StoredRecord, RestStoreError> {
    let id = row
        .id
        .map_or_else(|| format!("row-{position}"), id_string);
    let values = match row.descriptor {
        Descriptor::List(values) => values,
        Descriptor::Indexed(map) => {
            let mut indexed = map
                .into_iter()
                .map(|(k, v)| {
                    k.parse::<usize>()
                        .map(|i| (i, v))
                        .map_err(|_| {
                            RestStoreError::Malformed(format!(
                                "record {id}: descriptor key '{k}' is not an index"
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            // BTreeMap orders "10" before "2"; sort numerically.
            indexed.sort_by_key(|(i, _)| *i);
            indexed.into_iter().map(|(_, v)| v).collect()
        }
    };
    Ok(StoredRecord {
        id,
        embedding: Embedding::new(values),
        created_at: row.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP server: answers the first request with `status` and
    /// `body`, and yields the raw request it received.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map_or(0, |v| v.trim().parse::<usize>().unwrap());
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8(request).unwrap()
        });
        (base_url, handle)
    }

    /// Store pointed at a local server, bypassing any proxy from the environment.
    fn store_at(base_url: String) -> RestStore {
        RestStore {
            client: reqwest::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
            endpoint: format!("{base_url}/rest/v1/faces"),
            api_key: "test-key".into(),
        }
    }

    #[tokio::test]
    async fn test_list_sends_auth_and_select() {
        let (url, server) = serve_once(
            "200 OK",
            r#"[{"id": 1, "descriptor": [0.5, 1.0], "created_at": "2026-05-01T10:00:00Z"}, {"id": 2, "descriptor": {"0": 0.25, "1": 0.75}}]"#,
        )
        .await;
        let records = store_at(url).list_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "1");
        assert_eq!(records[1].embedding.values(), &[0.25, 0.75]);

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /rest/v1/faces?select="), "{request}");
        assert!(request.contains("apikey: test-key"), "{request}");
        assert!(request.contains("authorization: bearer test-key"), "{request}");
    }

    #[tokio::test]
    async fn test_list_tolerates_descriptor_only_table() {
        let (url, server) =
            serve_once("200 OK", r#"[{"descriptor": [0.1, 0.2]}, {"descriptor": [0.3, 0.4]}]"#)
                .await;
        let records = store_at(url).list_all().await.unwrap();
        server.await.unwrap();
        assert_eq!(records[0].id, "row-0");
        assert_eq!(records[1].id, "row-1");
        assert_eq!(records[1].embedding.values(), &[0.3, 0.4]);
        assert_eq!(records[1].created_at, None);
    }

    #[tokio::test]
    async fn test_append_posts_descriptor_and_returns_row() {
        let (url, server) = serve_once(
            "201 Created",
            r#"[{"id": 42, "descriptor": [0.5, 1.0], "created_at": "2026-05-01T10:00:00Z"}]"#,
        )
        .await;
        let record = store_at(url)
            .append(Embedding::with_model_version(vec![0.5, 1.0], "w600k_r50"))
            .await
            .unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.embedding.model_version(), Some("w600k_r50"));
        assert_eq!(record.created_at.as_deref(), Some("2026-05-01T10:00:00Z"));

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(lower.starts_with("post /rest/v1/faces "), "{request}");
        assert!(lower.contains("prefer: return=representation"), "{request}");
        assert!(lower.contains("content-type: application/json"), "{request}");
        assert!(request.ends_with(r#"[{"descriptor":[0.5,1.0]}]"#), "{request}");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (url, server) =
            serve_once("401 Unauthorized", r#"{"message":"invalid api key"}"#).await;
        let err = store_at(url).list_all().await.unwrap_err();
        server.await.unwrap();
        match err {
            RestStoreError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid api key"));
            }
            other => panic!("expected status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_insert_response_is_malformed() {
        let (url, server) = serve_once("201 Created", "[]").await;
        let err = store_at(url)
            .append(Embedding::new(vec![0.5]))
            .await
            .unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, RestStoreError::Malformed(_)), "{err}");
    }

    fn parse(json: &str) -> Vec<StoredRecord> {
        let rows: Vec<RestRow> = serde_json::from_str(json).unwrap();
        rows.into_iter()
            .enumerate()
            .map(|(i, row)| into_record(i, row))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_array_descriptor() {
        let records = parse(r#"[{"id": 7, "descriptor": [0.1, -0.2, 0.3], "created_at": "2026-05-01T10:00:00Z"}]"#);
        assert_eq!(records[0].id, "7");
        assert_eq!(records[0].embedding.values(), &[0.1, -0.2, 0.3]);
        assert_eq!(records[0].created_at.as_deref(), Some("2026-05-01T10:00:00Z"));
    }

    #[test]
    fn test_indexed_descriptor_sorted_numerically() {
        let mut obj = serde_json::Map::new();
        for i in 0..12 {
            obj.insert(i.to_string(), serde_json::json!(i as f32));
        }
        let json = serde_json::json!([{ "id": "abc", "descriptor": obj }]).to_string();
        let records = parse(&json);
        let expected: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(records[0].embedding.values(), expected.as_slice());
        assert_eq!(records[0].id, "abc");
        assert_eq!(records[0].created_at, None);
    }

    #[test]
    fn test_indexed_descriptor_rejects_non_numeric_key() {
        let rows: Vec<RestRow> =
            serde_json::from_str(r#"[{"id": 1, "descriptor": {"0": 0.1, "x": 0.2}}]"#).unwrap();
        let row = rows.into_iter().next().unwrap();
        let err = into_record(0, row).unwrap_err();
        assert!(matches!(err, RestStoreError::Malformed(_)), "{err}");
    }

    #[test]
    fn test_new_row_body() {
        let body = serde_json::to_string(&[NewRow { descriptor: &[0.5, 1.0] }]).unwrap();
        assert_eq!(body, r#"[{"descriptor":[0.5,1.0]}]"#);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let store = RestStore::new(&RestConfig {
            base_url: "https://example.supabase.co/".into(),
            api_key: "key".into(),
            table: "faces".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(store.endpoint, "https://example.supabase.co/rest/v1/faces");
    }
}
