//! Extraction and transformation providers.
//!
//! A [`DocumentProvider`] turns source bytes into a markdown transcript
//! (extract) and a transcript into structured metadata plus body
//! (transform). Either call may finish inline ([`ProviderOutcome::Completed`])
//! or be accepted for out-of-band completion ([`ProviderOutcome::Accepted`]),
//! in which case the provider posts the result to the job's callback URL.
//!
//! Two implementations:
//!
//! - [`LocalProvider`] runs [`crate::extract`] in-process and derives
//!   `title`, `pages`, and `chapters` from the markdown itself. It never
//!   accepts asynchronously.
//! - [`HttpProvider`] forwards both calls as JSON to an external service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use docflow_core::error::PipelineError;
use docflow_core::frontmatter;
use docflow_core::models::SourceRef;
use docflow_core::naming;

use crate::config::ProviderConfig;
use crate::extract;

/// Result of a provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome<T> {
    Completed(T),
    /// Accepted for asynchronous completion via callback.
    Accepted,
}

/// Where an accepting provider should report back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    pub url: String,
    /// Bearer secret the callback must present.
    pub token: String,
}

pub struct ExtractRequest<'a> {
    pub source: &'a SourceRef,
    pub bytes: &'a [u8],
    pub mime_type: &'a str,
    pub target_language: &'a str,
    pub callback: Option<CallbackTarget>,
}

pub struct TransformRequest<'a> {
    pub source: &'a SourceRef,
    /// Transcript body without frontmatter.
    pub transcript: &'a str,
    pub template: &'a str,
    pub target_language: &'a str,
    /// Page count reported by extraction, when known.
    pub pages: Option<u32>,
    pub callback: Option<CallbackTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub markdown: String,
    pub pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub meta: Map<String, Value>,
    pub markdown: String,
}

impl Transformed {
    /// Artifact text: frontmatter block followed by the body.
    pub fn render(&self) -> Result<String> {
        frontmatter::compose(&self.meta, &self.markdown)
    }
}

#[async_trait]
pub trait DocumentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<ProviderOutcome<Transcript>>;

    async fn transform(&self, request: &TransformRequest<'_>) -> Result<ProviderOutcome<Transformed>>;
}

/// Build the provider named by `[provider].kind`.
pub fn from_config(config: &ProviderConfig) -> Result<Box<dyn DocumentProvider>> {
    match config.kind.as_str() {
        "local" => Ok(Box::new(LocalProvider)),
        "http" => {
            let url = config
                .url
                .as_deref()
                .context("provider.url is required when provider.kind = \"http\"")?;
            Ok(Box::new(HttpProvider::new(url, config.timeout_secs)?))
        }
        other => bail!("Unknown provider kind: '{}'. Must be local or http.", other),
    }
}

// ============ Local ============

/// In-process provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

#[async_trait]
impl DocumentProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<ProviderOutcome<Transcript>> {
        let bytes = request.bytes.to_vec();
        let mime_type = request.mime_type.to_string();
        // pdf-extract is CPU-bound and synchronous.
        let extracted = tokio::task::spawn_blocking(move || extract::extract(&bytes, &mime_type))
            .await
            .context("extraction task panicked")?
            .with_context(|| format!("extracting {}", request.source.name))?;

        Ok(ProviderOutcome::Completed(Transcript {
            markdown: extracted.markdown,
            pages: Some(extracted.pages),
        }))
    }

    async fn transform(&self, request: &TransformRequest<'_>) -> Result<ProviderOutcome<Transformed>> {
        let body = request.transcript.trim();
        let chapters = chapters(body);
        let title = chapters
            .iter()
            .find(|c| c.level == 1)
            .map(|c| c.title.clone())
            .unwrap_or_else(|| naming::base_name(&request.source.name).to_string());
        let pages = request.pages.unwrap_or_else(|| count_pages(body)).max(1);

        let mut meta = Map::new();
        meta.insert("title".into(), Value::String(title));
        meta.insert("pages".into(), Value::from(pages));
        meta.insert(
            "chapters".into(),
            Value::Array(chapters.iter().map(Chapter::to_value).collect()),
        );
        meta.insert("language".into(), Value::String(request.target_language.to_string()));
        meta.insert("template".into(), Value::String(request.template.to_string()));

        Ok(ProviderOutcome::Completed(Transformed {
            meta,
            markdown: body.to_string(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Chapter {
    title: String,
    level: usize,
    order: usize,
}

impl Chapter {
    fn to_value(&self) -> Value {
        serde_json::json!({ "title": self.title, "level": self.level, "order": self.order })
    }
}

/// ATX headings in document order.
fn chapters(markdown: &str) -> Vec<Chapter> {
    let mut in_fence = false;
    let mut out = Vec::new();
    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if !(1..=6).contains(&level) {
            continue;
        }
        let rest = &trimmed[level..];
        if !rest.starts_with(' ') {
            continue;
        }
        let title = rest.trim().trim_end_matches('#').trim();
        if title.is_empty() {
            continue;
        }
        out.push(Chapter {
            title: title.to_string(),
            level,
            order: out.len() + 1,
        });
    }
    out
}

/// Pages separated by `---` rules, as written by PDF extraction.
fn count_pages(markdown: &str) -> u32 {
    let rules = markdown.lines().filter(|l| l.trim() == "---").count();
    rules as u32 + 1
}

// ============ HTTP ============

/// Provider backed by an external extraction/transformation service.
///
/// `POST {url}/extract` and `POST {url}/transform` take JSON bodies.
/// `202 Accepted` means the result arrives later via callback;
/// `200` carries `{ "status": "completed", "data": { "meta": {..}, "markdown": ".." } }`.
pub struct HttpProvider {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    data: Option<EnvelopeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    meta: Map<String, Value>,
    #[serde(default)]
    markdown: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, endpoint: &str, body: &Value) -> Result<Option<EnvelopeData>> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::TransientProvider(format!("{}: {}", url, e)))?;

        let status = response.status();
        debug!(%url, status = status.as_u16(), "provider responded");

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(None);
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::TransientProvider(format!("{} returned {}: {}", url, status, text)).into());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("{} returned {}: {}", url, status, text);
        }

        let envelope: Envelope = response
            .json()
            .await
            .with_context(|| format!("Invalid response body from {}", url))?;
        match envelope.status.as_deref() {
            Some("completed") | None => {}
            Some("accepted") | Some("queued") | Some("running") => return Ok(None),
            Some(other) => bail!(
                "{} reported status '{}': {}",
                url,
                other,
                envelope.error.unwrap_or_default()
            ),
        }
        envelope
            .data
            .map(Some)
            .with_context(|| format!("{} returned no data", url))
    }
}

fn callback_json(callback: &Option<CallbackTarget>) -> Value {
    match callback {
        Some(target) => serde_json::json!({ "url": target.url, "token": target.token }),
        None => Value::Null,
    }
}

fn source_json(source: &SourceRef) -> Value {
    serde_json::json!({ "item_id": source.item_id, "name": source.name })
}

#[async_trait]
impl DocumentProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<ProviderOutcome<Transcript>> {
        let body = serde_json::json!({
            "source": source_json(request.source),
            "mime_type": request.mime_type,
            "target_language": request.target_language,
            "content_base64": base64::engine::general_purpose::STANDARD.encode(request.bytes),
            "callback": callback_json(&request.callback),
        });
        let Some(data) = self.post("extract", &body).await? else {
            return Ok(ProviderOutcome::Accepted);
        };
        let pages = data
            .meta
            .get("pages")
            .and_then(Value::as_u64)
            .map(|p| p as u32);
        Ok(ProviderOutcome::Completed(Transcript {
            markdown: data.markdown,
            pages,
        }))
    }

    async fn transform(&self, request: &TransformRequest<'_>) -> Result<ProviderOutcome<Transformed>> {
        let body = serde_json::json!({
            "source": source_json(request.source),
            "template": request.template,
            "target_language": request.target_language,
            "pages": request.pages,
            "markdown": request.transcript,
            "callback": callback_json(&request.callback),
        });
        let Some(data) = self.post("transform", &body).await? else {
            return Ok(ProviderOutcome::Accepted);
        };
        // Some services return the metadata embedded in the markdown.
        let embedded = frontmatter::analyze(&data.markdown);
        let (meta, markdown) = if data.meta.is_empty() && embedded.has_frontmatter {
            (embedded.meta, embedded.body)
        } else {
            (data.meta, data.markdown)
        };
        Ok(ProviderOutcome::Completed(Transformed { meta, markdown }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::storage::ROOT_ID;

    fn source() -> SourceRef {
        SourceRef {
            item_id: "report.pdf".to_string(),
            parent_id: ROOT_ID.to_string(),
            name: "report.pdf".to_string(),
            mime_type: None,
        }
    }

    #[test]
    fn chapters_follow_headings_outside_fences() {
        let md = "# Intro\n\ntext\n\n```\n# not a heading\n```\n\n## Details ##\n\n#hashtag";
        let found = chapters(md);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].title, "Intro");
        assert_eq!(found[1].title, "Details");
        assert_eq!(found[1].level, 2);
        assert_eq!(found[1].order, 2);
    }

    #[tokio::test]
    async fn local_transform_produces_core_frontmatter() {
        let src = source();
        let request = TransformRequest {
            source: &src,
            transcript: "page one\n\n---\n\npage two\n\n---\n\npage three",
            template: "default",
            target_language: "de",
            pages: None,
            callback: None,
        };
        let ProviderOutcome::Completed(out) = LocalProvider.transform(&request).await.unwrap() else {
            panic!("local provider never accepts");
        };
        assert_eq!(out.meta["pages"], serde_json::json!(3));
        assert_eq!(out.meta["title"], serde_json::json!("report"));
        assert!(frontmatter::has_core(&out.meta));

        let rendered = out.render().unwrap();
        let parsed = frontmatter::analyze(&rendered);
        assert!(parsed.has_frontmatter);
        assert!(parsed.body.starts_with("page one"));
    }

    #[tokio::test]
    async fn local_extract_passes_markdown_through() {
        let src = source();
        let request = ExtractRequest {
            source: &src,
            bytes: b"# Title\n\nBody",
            mime_type: extract::MIME_MARKDOWN,
            target_language: "de",
            callback: None,
        };
        let ProviderOutcome::Completed(t) = LocalProvider.extract(&request).await.unwrap() else {
            panic!("local provider never accepts");
        };
        assert_eq!(t.markdown, "# Title\n\nBody");
        assert_eq!(t.pages, Some(1));
    }

    #[test]
    fn unknown_provider_kind_is_rejected() {
        let config = ProviderConfig {
            kind: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(from_config(&config).is_err());
    }
}
