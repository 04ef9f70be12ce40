//! Per-call conversation memory.
//!
//! [`ContextStore`] pairs an [`Embedder`] with a [`VectorIndex`]. Writes are
//! all-or-nothing: every record of a batch is embedded before anything is
//! handed to the index, so a failed embedding leaves the index untouched.
//! Reads are always scoped to one call.

use crate::embedding::Embedder;
use crate::error::ContextError;
use crate::index::VectorIndex;
use callbridge_types::ContextRecord;
use std::sync::Arc;

#[derive(Clone)]
pub struct ContextStore {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl ContextStore {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Returns up to `top_k` earlier turns of `call_id`, most relevant to
    /// `query` first.
    ///
    /// # Errors
    ///
    /// Every failure, including an empty query, is reported as
    /// [`ContextError::Retrieval`].
    pub async fn retrieve(
        &self,
        call_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ContextRecord>, ContextError> {
        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| ContextError::Retrieval(e.to_string()))?;

        let hits = self
            .index
            .query(call_id, &vector, top_k)
            .await
            .map_err(|e| ContextError::Retrieval(e.to_string()))?;

        tracing::debug!(call_id, hits = hits.len(), "context retrieved");
        Ok(hits.into_iter().map(|hit| hit.record).collect())
    }

    /// Embeds and writes `records` as one batch, returning how many were
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::PartialWrite`] if any record cannot be
    /// embedded; nothing is written in that case. Index failures are
    /// returned as reported by the index.
    pub async fn store(&self, records: Vec<ContextRecord>) -> Result<usize, ContextError> {
        let mut embedded = Vec::with_capacity(records.len());
        for mut record in records {
            match self.embedder.embed(&record.text).await {
                Ok(vector) => {
                    record.embedding = vector;
                    embedded.push(record);
                }
                Err(e) => {
                    return Err(ContextError::PartialWrite(format!(
                        "{} record {} could not be embedded: {}",
                        record.role.as_str(),
                        record.id,
                        e
                    )));
                }
            }
        }

        self.index.upsert(&embedded).await?;
        tracing::debug!(records = embedded.len(), "context stored");
        Ok(embedded.len())
    }
}
