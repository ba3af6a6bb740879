//! Search-index writer used by the ingest phase.
//!
//! [`SqliteIndex`] keeps one `documents` row per source item (upserted by
//! `source_id`) and replaces its `chunks` and `chunks_fts` rows in a single
//! transaction, so a reader never sees a half-replaced document.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use docflow_core::chunk::{chunk_text, Chunk};

/// A finished artifact handed to the sink.
#[derive(Debug, Clone)]
pub struct IngestDocument {
    pub source_id: String,
    pub artifact_id: String,
    pub title: Option<String>,
    pub language: String,
    pub library_id: Option<String>,
    /// Markdown body without frontmatter.
    pub body: String,
    pub meta: Map<String, Value>,
    /// Hash of the full artifact text, used to detect re-ingestion.
    pub artifact_hash: String,
}

#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Index `doc`, returning the number of chunks written.
    async fn ingest(&self, doc: &IngestDocument) -> Result<usize>;

    /// Whether `source_id` is indexed at exactly `artifact_hash`.
    async fn is_ingested(&self, source_id: &str, artifact_hash: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
    max_tokens: usize,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, max_tokens: usize) -> Self {
        Self { pool, max_tokens }
    }

    async fn upsert_document(&self, doc: &IngestDocument) -> Result<String> {
        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source_id = ?")
                .bind(&doc.source_id)
                .fetch_optional(&self.pool)
                .await?;
        let doc_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, artifact_id, title, language, library_id, body,
                                   metadata_json, artifact_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                artifact_id = excluded.artifact_id,
                title = excluded.title,
                language = excluded.language,
                library_id = excluded.library_id,
                body = excluded.body,
                metadata_json = excluded.metadata_json,
                artifact_hash = excluded.artifact_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc_id)
        .bind(&doc.source_id)
        .bind(&doc.artifact_id)
        .bind(&doc.title)
        .bind(&doc.language)
        .bind(&doc.library_id)
        .bind(&doc.body)
        .bind(serde_json::to_string(&doc.meta)?)
        .bind(&doc.artifact_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(doc_id)
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl IngestSink for SqliteIndex {
    async fn ingest(&self, doc: &IngestDocument) -> Result<usize> {
        let doc_id = self.upsert_document(doc).await?;
        let chunks = chunk_text(&doc_id, &doc.body, self.max_tokens);
        self.replace_chunks(&doc_id, &chunks).await?;
        debug!(source = %doc.source_id, chunks = chunks.len(), "document indexed");
        Ok(chunks.len())
    }

    async fn is_ingested(&self, source_id: &str, artifact_hash: &str) -> Result<bool> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT artifact_hash FROM documents WHERE source_id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(stored.as_deref() == Some(artifact_hash))
    }
}
