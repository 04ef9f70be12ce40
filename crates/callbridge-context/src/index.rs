//! Vector indexes holding embedded conversation turns.
//!
//! Every query is scoped to one call: an index never returns a record whose
//! `call_id` differs from the one asked for.

use crate::error::ContextError;
use async_trait::async_trait;
use callbridge_db::DbPool;
use callbridge_types::{ContextRecord, Role};
use chrono::{DateTime, Utc};
use rusqlite::params;

/// A record with its similarity to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: ContextRecord,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Writes all records as one batch. Either every record lands or none do.
    async fn upsert(&self, records: &[ContextRecord]) -> Result<(), ContextError>;

    /// Returns up to `top_k` records of `call_id`, most similar first.
    async fn query(
        &self,
        call_id: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, ContextError>;
}

/// Cosine similarity of two vectors; 0.0 on dimension mismatch or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Orders by decreasing score, newest first on ties, and keeps `top_k`.
pub(crate) fn rank(mut scored: Vec<ScoredRecord>, top_k: usize) -> Vec<ScoredRecord> {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
    });
    scored.truncate(top_k);
    scored
}

fn ensure_embedded(records: &[ContextRecord]) -> Result<(), ContextError> {
    match records.iter().find(|r| r.embedding.is_empty()) {
        Some(r) => Err(ContextError::Index(format!(
            "record {} has no embedding",
            r.id
        ))),
        None => Ok(()),
    }
}

/// Local index backed by the `context_records` table.
///
/// Similarity is computed by brute force over the rows of a single call,
/// which stays small for the lifetime of one phone conversation.
#[derive(Debug, Clone)]
pub struct SqliteIndex {
    pool: DbPool,
}

impl SqliteIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn insert_batch(pool: &DbPool, records: &[ContextRecord]) -> Result<(), ContextError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO context_records
                (id, call_id, role, text, embedding_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for record in records {
            stmt.execute(params![
                record.id,
                record.call_id,
                record.role.as_str(),
                record.text,
                serde_json::to_string(&record.embedding)?,
                record.created_at.to_rfc3339(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

type RawRow = (String, String, String, String, String, String);

fn decode_row(raw: RawRow) -> Result<ContextRecord, ContextError> {
    let (id, call_id, role, text, embedding_json, created_at) = raw;
    let role: Role = role.parse().map_err(ContextError::Index)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| ContextError::Index(format!("bad timestamp on {}: {}", id, e)))?
        .with_timezone(&Utc);
    Ok(ContextRecord {
        id,
        call_id,
        role,
        text,
        embedding: serde_json::from_str(&embedding_json)?,
        created_at,
    })
}

fn select_call(
    pool: &DbPool,
    call_id: &str,
    vector: &[f32],
    top_k: usize,
) -> Result<Vec<ScoredRecord>, ContextError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, call_id, role, text, embedding_json, created_at
         FROM context_records
         WHERE call_id = ?1",
    )?;
    let rows = stmt.query_map(params![call_id], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    })?;

    let mut scored = Vec::new();
    for row in rows {
        let record = decode_row(row?)?;
        let score = cosine_similarity(vector, &record.embedding);
        scored.push(ScoredRecord { record, score });
    }
    Ok(rank(scored, top_k))
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, records: &[ContextRecord]) -> Result<(), ContextError> {
        if records.is_empty() {
            return Ok(());
        }
        ensure_embedded(records)?;

        let pool = self.pool.clone();
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || insert_batch(&pool, &records))
            .await
            .map_err(|e| ContextError::Index(format!("index write task failed: {}", e)))?
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

        let pool = self.pool.clone();
        let call_id = call_id.to_string();
        let vector = vector.to_vec();
        tokio::task::spawn_blocking(move || select_call(&pool, &call_id, &vector, top_k))
            .await
            .map_err(|e| ContextError::Index(format!("index read task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_db::{create_pool, run_migrations, DbRuntimeSettings};

    fn test_index() -> (tempfile::TempDir, SqliteIndex) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        (dir, SqliteIndex::new(pool))
    }

    fn embedded(call_id: &str, role: Role, text: &str, embedding: Vec<f32>) -> ContextRecord {
        let mut record = ContextRecord::new(call_id, role, text);
        record.embedding = embedding;
        record
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-5);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-5);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn query_orders_by_similarity_and_truncates() {
        let (_dir, index) = test_index();
        index
            .upsert(&[
                embedded("call-1", Role::User, "far", vec![0.0, 1.0]),
                embedded("call-1", Role::Assistant, "near", vec![1.0, 0.1]),
                embedded("call-1", Role::User, "exact", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.query("call-1", &[1.0, 0.0], 2).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.record.text.as_str()).collect();
        assert_eq!(texts, vec!["exact", "near"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn unembedded_batch_is_rejected_whole() {
        let (_dir, index) = test_index();
        let err = index
            .upsert(&[
                embedded("call-1", Role::User, "hi", vec![1.0, 0.0]),
                ContextRecord::new("call-1", Role::Assistant, ""),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Index(_)));
        assert!(index.query("call-1", &[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_round_trip_through_sqlite() {
        let (_dir, index) = test_index();
        let original = embedded("call-9", Role::Assistant, "Try restarting.", vec![0.25, 0.5]);
        index.upsert(std::slice::from_ref(&original)).await.unwrap();

        let hits = index.query("call-9", &[0.25, 0.5], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        let stored = &hits[0].record;
        assert_eq!(stored.id, original.id);
        assert_eq!(stored.role, Role::Assistant);
        assert_eq!(stored.embedding, original.embedding);
        assert_eq!(
            stored.created_at.timestamp_micros(),
            original.created_at.timestamp_micros()
        );
    }
}
