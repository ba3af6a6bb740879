//! Out-of-band completion callbacks.
//!
//! When a provider accepts a request asynchronously, the dispatching
//! worker stores the SHA-256 digest of a fresh bearer secret on the job
//! and parks it. The provider later posts its result with that secret.
//! [`CallbackChannel::deliver`] checks the digest, writes the payload to
//! the `callbacks` inbox keyed by `(job_id, secret_hash)`, and un-parks
//! the job so whichever worker claims it next picks the message up with
//! [`CallbackChannel::take`].

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use docflow_core::error::PipelineError;
use docflow_core::frontmatter;
use docflow_core::models::{trace_names, TraceEvent};

use crate::queue::JobQueue;

/// Body posted by a provider when an accepted request finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    #[serde(default = "default_status")]
    pub status: String,
    /// Structured fields produced by the transformation.
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_status() -> String {
    "completed".to_string()
}

impl CallbackPayload {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// Whether the payload itself carries complete core frontmatter.
    pub fn has_core_frontmatter(&self) -> bool {
        if frontmatter::has_core(&self.meta) {
            return true;
        }
        let embedded = frontmatter::analyze(&self.markdown);
        embedded.has_frontmatter && frontmatter::has_core(&embedded.meta)
    }
}

/// Hex SHA-256 of a bearer secret.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// New per-dispatch secret and its digest.
pub fn new_secret() -> (String, String) {
    let secret = uuid::Uuid::new_v4().to_string();
    let hash = hash_secret(&secret);
    (secret, hash)
}

#[derive(Clone)]
pub struct CallbackChannel {
    queue: JobQueue,
}

impl CallbackChannel {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Accept a callback for `job_id` authenticated by `bearer`.
    pub async fn deliver(&self, job_id: &str, bearer: &str, payload: &CallbackPayload) -> Result<()> {
        let stored = self.queue.callback_secret_hash(job_id).await?;
        let presented = hash_secret(bearer);
        let authorized = stored
            .as_deref()
            .map(|h| bool::from(h.as_bytes().ct_eq(presented.as_bytes())))
            .unwrap_or(false);
        if !authorized {
            warn!(job_id, "callback rejected: secret mismatch");
            return Err(PipelineError::Unauthorized("callback secret does not match".into()).into());
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO callbacks (job_id, secret_hash, payload_json, received_at, consumed_at)
            VALUES (?, ?, ?, ?, NULL)
            ON CONFLICT(job_id, secret_hash) DO UPDATE SET
                payload_json = excluded.payload_json,
                received_at = excluded.received_at,
                consumed_at = NULL
            "#,
        )
        .bind(job_id)
        .bind(&presented)
        .bind(serde_json::to_string(payload)?)
        .bind(now.timestamp_millis())
        .execute(self.queue.pool())
        .await?;

        self.queue.unpark(job_id).await?;
        self.queue
            .append_trace(
                job_id,
                &TraceEvent::at(
                    now,
                    trace_names::CALLBACK_RECEIVED,
                    serde_json::json!({ "status": payload.status }),
                ),
            )
            .await?;
        info!(job_id, status = %payload.status, "callback received");
        Ok(())
    }

    /// Consume the newest pending callback for `job_id`.
    pub async fn take(&self, job_id: &str) -> Result<Option<CallbackPayload>> {
        let consumed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE callbacks SET consumed_at = ?
            WHERE rowid = (
                SELECT rowid FROM callbacks
                WHERE job_id = ? AND consumed_at IS NULL
                ORDER BY received_at DESC
                LIMIT 1
            ) AND consumed_at IS NULL
            RETURNING payload_json
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(job_id)
        .fetch_optional(self.queue.pool())
        .await?;

        consumed
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_hash_is_hex_sha256() {
        let (secret, hash) = new_secret();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_secret(&secret));
        assert_ne!(hash, hash_secret("other"));
    }

    #[test]
    fn payload_core_frontmatter_from_meta_or_markdown() {
        let mut payload = CallbackPayload {
            status: "completed".to_string(),
            meta: serde_json::Map::new(),
            markdown: "---\npages: 2\nchapters: []\n---\n\nBody".to_string(),
            error: None,
        };
        assert!(payload.has_core_frontmatter());

        payload.markdown = "Body".to_string();
        assert!(!payload.has_core_frontmatter());

        payload.meta.insert("pages".into(), serde_json::json!(4));
        payload.meta.insert("chapters".into(), serde_json::json!([]));
        assert!(payload.has_core_frontmatter());
    }

    async fn queue_with_secret() -> (tempfile::TempDir, JobQueue, String, String) {
        use docflow_core::models::{Correlation, JobOptions, NewJob, SourceRef};

        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::open(&tmp.path().join("cb.sqlite")).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let queue = JobQueue::new(pool, crate::queue::QueueOptions::default());
        let job = queue
            .enqueue(NewJob {
                job_type: "pdf".to_string(),
                correlation: Correlation {
                    source: SourceRef {
                        item_id: "a.pdf".to_string(),
                        parent_id: "root".to_string(),
                        name: "a.pdf".to_string(),
                        mime_type: None,
                    },
                    options: JobOptions {
                        target_language: "de".to_string(),
                        source_language: None,
                        template: None,
                        use_cache: true,
                    },
                },
                policies: Default::default(),
                user_email: None,
                library_id: None,
                batch_id: None,
                max_attempts: None,
            })
            .await
            .unwrap();
        let claim = queue.claim().await.unwrap().unwrap();
        let (secret, hash) = new_secret();
        queue.set_callback_secret(&job.id, claim.process_id(), &hash).await.unwrap();
        (tmp, queue, job.id, secret)
    }

    #[tokio::test]
    async fn deliver_checks_bearer_digest() {
        let (_tmp, queue, id, secret) = queue_with_secret().await;
        let channel = CallbackChannel::new(queue);
        let payload = CallbackPayload {
            status: "completed".to_string(),
            meta: serde_json::Map::new(),
            markdown: "Body".to_string(),
            error: None,
        };

        // Same length as a real secret, different bytes.
        let forged = uuid::Uuid::new_v4().to_string();
        let err = channel.deliver(&id, &forged, &payload).await.unwrap_err();
        assert_eq!(docflow_core::error::error_code(&err), "unauthorized");
        assert!(channel.take(&id).await.unwrap().is_none());

        channel.deliver(&id, &secret, &payload).await.unwrap();
        assert_eq!(channel.take(&id).await.unwrap(), Some(payload));
        assert!(channel.take(&id).await.unwrap().is_none());
    }
}
