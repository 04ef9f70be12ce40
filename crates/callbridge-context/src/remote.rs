//! Pinecone-style hosted vector index.

use crate::error::ContextError;
use crate::index::{rank, ScoredRecord, VectorIndex};
use async_trait::async_trait;
use callbridge_types::{ContextRecord, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Connection settings for a hosted index.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct PineconeConfig {
    /// Index host, e.g. `https://callbridge-abc123.svc.us-east-1.pinecone.io`.
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl fmt::Debug for PineconeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PineconeConfig")
            .field("host", &self.host)
            .field("api_key", &"[REDACTED]")
            .field("namespace", &self.namespace)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordMetadata {
    text: String,
    role: String,
    call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

#[derive(Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: RecordMetadata,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    vectors: Vec<UpsertVector<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    vector: &'a [f32],
    top_k: usize,
    filter: serde_json::Value,
    include_metadata: bool,
    include_values: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    values: Vec<f32>,
    metadata: Option<RecordMetadata>,
}

/// Remote index speaking the Pinecone data-plane API.
#[derive(Debug, Clone)]
pub struct PineconeIndex {
    client: reqwest::Client,
    config: PineconeConfig,
}

impl PineconeIndex {
    pub fn new(config: PineconeConfig) -> Result<Self, ContextError> {
        if config.host.trim().is_empty() {
            return Err(ContextError::Index("pinecone host is not configured".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ContextError::Index(format!("failed to build index client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        let host = self.config.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}{}", host, path)
        } else {
            format!("https://{}{}", host, path)
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ContextError> {
        let response = self
            .client
            .post(self.url(path))
            .header("Api-Key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ContextError::Index(format!("index request to {} failed: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ContextError::Index(format!(
                "index {} returned {}: {}",
                path, status, detail
            )));
        }
        Ok(response)
    }
}

fn decode_match(m: QueryMatch, call_id: &str) -> Option<ScoredRecord> {
    let metadata = m.metadata?;
    // The server-side filter is trusted only as an optimization.
    if metadata.call_id != call_id {
        tracing::warn!(id = %m.id, "index returned a record from another call; dropped");
        return None;
    }
    let role = metadata.role.parse::<Role>().ok()?;
    let created_at = metadata
        .created_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(ScoredRecord {
        record: ContextRecord {
            id: m.id,
            call_id: metadata.call_id,
            role,
            text: metadata.text,
            embedding: m.values,
            created_at,
        },
        score: m.score,
    })
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(&self, records: &[ContextRecord]) -> Result<(), ContextError> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(r) = records.iter().find(|r| r.embedding.is_empty()) {
            return Err(ContextError::Index(format!("record {} has no embedding", r.id)));
        }

        let body = UpsertBody {
            vectors: records
                .iter()
                .map(|r| UpsertVector {
                    id: &r.id,
                    values: &r.embedding,
                    metadata: RecordMetadata {
                        text: r.text.clone(),
                        role: r.role.as_str().to_string(),
                        call_id: r.call_id.clone(),
                        created_at: Some(r.created_at.to_rfc3339()),
                    },
                })
                .collect(),
            namespace: self.config.namespace.as_deref(),
        };

        self.post("/vectors/upsert", &body).await?;
        tracing::debug!(records = records.len(), "context upserted to remote index");
        Ok(())
    }

    async fn query(
        &self,
        call_id: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, ContextError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let body = QueryBody {
            vector,
            top_k,
            filter: serde_json::json!({ "call_id": { "$eq": call_id } }),
            include_metadata: true,
            include_values: false,
            namespace: self.config.namespace.as_deref(),
        };

        let response: QueryResponse = self
            .post("/query", &body)
            .await?
            .json()
            .await
            .map_err(|e| ContextError::Index(format!("malformed query response: {}", e)))?;

        let scored = response
            .matches
            .into_iter()
            .filter_map(|m| decode_match(m, call_id))
            .collect();
        Ok(rank(scored, top_k))
    }
}
