//! Artifact lookup for shadow twins.
//!
//! [`ArtifactResolver`] maps `(source, kind, target language, template)` to
//! a stored file. The canonical location is the source's shadow folder
//! (see [`crate::naming`]); a sibling file next to the source is accepted
//! as a legacy fallback when the resolver is built with
//! `allow_legacy_fallback`.
//!
//! A transformation is looked up in this order:
//!
//! 1. `{base}.{template}.{lang}.md` when a template is requested;
//! 2. any `{base}.*.{lang}.md` when no template is requested;
//! 3. `{base}.{lang}.md` inside the shadow folder if it carries
//!    frontmatter (an adopted legacy artifact).

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::frontmatter;
use crate::models::SourceRef;
use crate::naming::{self, ArtifactKind};
use crate::storage::{StorageItem, StorageProvider};

/// Where a resolved artifact was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLocation {
    Shadow,
    LegacySibling,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedArtifact {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub kind: ArtifactKind,
    pub template: Option<String>,
    pub location: ArtifactLocation,
    /// Loaded on demand.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ResolvedArtifact {
    fn from_item(
        item: StorageItem,
        kind: ArtifactKind,
        template: Option<String>,
        location: ArtifactLocation,
    ) -> Self {
        Self {
            id: item.id,
            name: item.name,
            parent_id: item.parent_id,
            kind,
            template,
            location,
            content: None,
        }
    }
}

/// Options for [`ArtifactResolver::exists`].
#[derive(Debug, Clone, Default)]
pub struct ExistsOptions<'a> {
    /// Let a transformation satisfy a transcript query.
    pub include_supersets: bool,
    pub template_name: Option<&'a str>,
}

pub struct ArtifactResolver {
    storage: Arc<dyn StorageProvider>,
    allow_legacy_fallback: bool,
}

impl ArtifactResolver {
    pub fn new(storage: Arc<dyn StorageProvider>, allow_legacy_fallback: bool) -> Self {
        Self {
            storage,
            allow_legacy_fallback,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    pub fn allows_legacy_fallback(&self) -> bool {
        self.allow_legacy_fallback
    }

    /// The source's shadow folder, if it has been created.
    pub async fn shadow_folder(&self, source: &SourceRef) -> Result<Option<StorageItem>> {
        let name = naming::shadow_folder_name(&source.name);
        Ok(self
            .storage
            .find_child(&source.parent_id, &name)
            .await?
            .filter(StorageItem::is_folder))
    }

    pub async fn ensure_shadow_folder(&self, source: &SourceRef) -> Result<StorageItem> {
        if let Some(folder) = self.shadow_folder(source).await? {
            return Ok(folder);
        }
        let name = naming::shadow_folder_name(&source.name);
        self.storage.create_folder(&source.parent_id, &name).await
    }

    /// Look up one artifact kind in the shadow folder only.
    pub async fn find(
        &self,
        source: &SourceRef,
        kind: ArtifactKind,
        language: &str,
        template: Option<&str>,
    ) -> Result<Option<ResolvedArtifact>> {
        let Some(folder) = self.shadow_folder(source).await? else {
            return Ok(None);
        };
        let children = self.storage.list_children(&folder.id).await?;
        let base = naming::base_name(&source.name);

        match kind {
            ArtifactKind::Transcript => {
                let name = naming::transcript_file_name(base, language);
                Ok(children
                    .into_iter()
                    .find(|c| c.is_file() && c.name == name)
                    .map(|item| {
                        ResolvedArtifact::from_item(item, kind, None, ArtifactLocation::Shadow)
                    }))
            }
            ArtifactKind::Transformation => {
                self.find_transformation(children, base, language, template)
                    .await
            }
        }
    }

    async fn find_transformation(
        &self,
        children: Vec<StorageItem>,
        base: &str,
        language: &str,
        template: Option<&str>,
    ) -> Result<Option<ResolvedArtifact>> {
        let mut files: Vec<StorageItem> = children.into_iter().filter(StorageItem::is_file).collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let matched = files.iter().find(|item| {
            match naming::parse_artifact_name(base, &item.name) {
                Some(parsed) if parsed.kind == ArtifactKind::Transformation && parsed.language == language => {
                    template.map_or(true, |t| parsed.template.as_deref() == Some(t))
                }
                _ => false,
            }
        });
        if let Some(item) = matched {
            let template = naming::parse_artifact_name(base, &item.name).and_then(|p| p.template);
            return Ok(Some(ResolvedArtifact::from_item(
                item.clone(),
                ArtifactKind::Transformation,
                template,
                ArtifactLocation::Shadow,
            )));
        }

        // Adopted legacy file: transcript name, but with frontmatter.
        let adopted_name = naming::legacy_file_name(base, language);
        if let Some(item) = files.into_iter().find(|c| c.name == adopted_name) {
            let text = self.storage.get_text(&item.id).await?;
            if frontmatter::analyze(&text).has_frontmatter {
                let mut artifact = ResolvedArtifact::from_item(
                    item,
                    ArtifactKind::Transformation,
                    None,
                    ArtifactLocation::Shadow,
                );
                artifact.content = Some(text);
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    /// Sibling file `{base}.{lang}.md` directly next to the source.
    pub async fn find_legacy(&self, source: &SourceRef, language: &str) -> Result<Option<StorageItem>> {
        let name = naming::legacy_file_name(naming::base_name(&source.name), language);
        Ok(self
            .storage
            .find_child(&source.parent_id, &name)
            .await?
            .filter(StorageItem::is_file))
    }

    /// Resolve the best artifact for `source`.
    ///
    /// Tries `preferred` in the shadow folder, then the other kind, then
    /// (if permitted) the legacy sibling file.
    pub async fn resolve(
        &self,
        source: &SourceRef,
        language: &str,
        preferred: ArtifactKind,
        template: Option<&str>,
        with_content: bool,
    ) -> Result<Option<ResolvedArtifact>> {
        let mut found = self.find(source, preferred, language, template).await?;
        if found.is_none() {
            found = self.find(source, preferred.other(), language, template).await?;
        }
        if found.is_none() && self.allow_legacy_fallback {
            if let Some(item) = self.find_legacy(source, language).await? {
                let text = self.storage.get_text(&item.id).await?;
                let kind = if frontmatter::analyze(&text).has_frontmatter {
                    ArtifactKind::Transformation
                } else {
                    ArtifactKind::Transcript
                };
                let mut artifact =
                    ResolvedArtifact::from_item(item, kind, None, ArtifactLocation::LegacySibling);
                artifact.content = Some(text);
                found = Some(artifact);
            }
        }

        match found {
            Some(mut artifact) => {
                if with_content {
                    self.load_content(&mut artifact).await?;
                } else {
                    artifact.content = None;
                }
                Ok(Some(artifact))
            }
            None => Ok(None),
        }
    }

    /// Whether an artifact of `kind` exists in the shadow folder.
    pub async fn exists(
        &self,
        source: &SourceRef,
        kind: ArtifactKind,
        language: &str,
        options: ExistsOptions<'_>,
    ) -> Result<bool> {
        if self
            .find(source, kind, language, options.template_name)
            .await?
            .is_some()
        {
            return Ok(true);
        }
        if kind == ArtifactKind::Transcript && options.include_supersets {
            return Ok(self
                .find(source, ArtifactKind::Transformation, language, None)
                .await?
                .is_some());
        }
        Ok(false)
    }

    pub async fn load_content(&self, artifact: &mut ResolvedArtifact) -> Result<()> {
        if artifact.content.is_none() {
            artifact.content = Some(self.storage.get_text(&artifact.id).await?);
        }
        Ok(())
    }

    /// Write an artifact under its canonical name, creating the shadow
    /// folder if needed.
    pub async fn write_artifact(
        &self,
        source: &SourceRef,
        kind: ArtifactKind,
        language: &str,
        template: Option<&str>,
        content: &str,
    ) -> Result<ResolvedArtifact> {
        let folder = self.ensure_shadow_folder(source).await?;
        let base = naming::base_name(&source.name);
        let name = match (kind, template) {
            (ArtifactKind::Transformation, Some(t)) => naming::transformation_file_name(base, t, language),
            (ArtifactKind::Transformation, None) => {
                anyhow::bail!("a transformation artifact needs a template name")
            }
            (ArtifactKind::Transcript, _) => naming::transcript_file_name(base, language),
        };
        let item = self
            .storage
            .upload_file(&folder.id, &name, content.as_bytes(), "text/markdown")
            .await?;
        tracing::debug!(artifact = %item.name, kind = %kind, "artifact written");

        let mut artifact = ResolvedArtifact::from_item(
            item,
            kind,
            template.map(str::to_string),
            ArtifactLocation::Shadow,
        );
        artifact.content = Some(content.to_string());
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;
    use crate::storage::ROOT_ID;

    const WITH_FM: &str = "---\npages: 3\nchapters: []\n---\n\nBody";

    fn setup() -> (Arc<InMemoryStorage>, SourceRef) {
        let storage = Arc::new(InMemoryStorage::new());
        let item = storage.seed_file(ROOT_ID, "report.pdf", b"%PDF", "application/pdf");
        let source = SourceRef {
            item_id: item.id,
            parent_id: ROOT_ID.to_string(),
            name: "report.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
        };
        (storage, source)
    }

    #[tokio::test]
    async fn written_artifact_resolves_to_same_reference() {
        let (storage, source) = setup();
        let resolver = ArtifactResolver::new(storage.clone(), false);

        let written = resolver
            .write_artifact(&source, ArtifactKind::Transformation, "de", Some("summary"), WITH_FM)
            .await
            .unwrap();
        assert_eq!(written.name, "report.summary.de.md");

        let found = resolver
            .resolve(&source, "de", ArtifactKind::Transformation, Some("summary"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, written.id);
        assert_eq!(found.location, ArtifactLocation::Shadow);
        assert!(found.content.is_none());

        let transcript = resolver
            .write_artifact(&source, ArtifactKind::Transcript, "de", None, "plain")
            .await
            .unwrap();
        let found = resolver
            .resolve(&source, "de", ArtifactKind::Transcript, None, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, transcript.id);
        assert_eq!(found.content.as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn transformation_satisfies_transcript_existence() {
        let (storage, source) = setup();
        let resolver = ArtifactResolver::new(storage.clone(), false);
        resolver
            .write_artifact(&source, ArtifactKind::Transformation, "de", Some("default"), WITH_FM)
            .await
            .unwrap();

        let strict = ExistsOptions::default();
        assert!(!resolver
            .exists(&source, ArtifactKind::Transcript, "de", strict)
            .await
            .unwrap());

        let superset = ExistsOptions {
            include_supersets: true,
            template_name: None,
        };
        assert!(resolver
            .exists(&source, ArtifactKind::Transcript, "de", superset)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn template_and_language_must_match() {
        let (storage, source) = setup();
        let resolver = ArtifactResolver::new(storage.clone(), false);
        resolver
            .write_artifact(&source, ArtifactKind::Transformation, "de", Some("default"), WITH_FM)
            .await
            .unwrap();

        let other_template = ExistsOptions {
            include_supersets: false,
            template_name: Some("summary"),
        };
        assert!(!resolver
            .exists(&source, ArtifactKind::Transformation, "de", other_template)
            .await
            .unwrap());
        assert!(resolver
            .find(&source, ArtifactKind::Transformation, "en", None)
            .await
            .unwrap()
            .is_none());
        assert!(resolver
            .find(&source, ArtifactKind::Transformation, "de", None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn legacy_sibling_only_with_fallback() {
        let (storage, source) = setup();
        let legacy = storage.seed_file(ROOT_ID, "report.de.md", WITH_FM.as_bytes(), "text/markdown");

        let strict = ArtifactResolver::new(storage.clone(), false);
        assert!(strict
            .resolve(&source, "de", ArtifactKind::Transformation, None, false)
            .await
            .unwrap()
            .is_none());

        let lenient = ArtifactResolver::new(storage.clone(), true);
        let found = lenient
            .resolve(&source, "de", ArtifactKind::Transformation, None, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, legacy.id);
        assert_eq!(found.location, ArtifactLocation::LegacySibling);
        assert_eq!(found.kind, ArtifactKind::Transformation);
    }

    #[tokio::test]
    async fn adopted_legacy_counts_as_transformation() {
        let (storage, source) = setup();
        let folder = storage.seed_folder(ROOT_ID, ".report.pdf");
        storage.seed_file(&folder.id, "report.de.md", WITH_FM.as_bytes(), "text/markdown");

        let resolver = ArtifactResolver::new(storage.clone(), false);
        let found = resolver
            .find(&source, ArtifactKind::Transformation, "de", Some("default"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "report.de.md");
        assert!(found.template.is_none());
    }

    #[tokio::test]
    async fn plain_transcript_is_not_a_transformation() {
        let (storage, source) = setup();
        let folder = storage.seed_folder(ROOT_ID, ".report.pdf");
        storage.seed_file(&folder.id, "report.de.md", b"no frontmatter", "text/markdown");

        let resolver = ArtifactResolver::new(storage.clone(), false);
        assert!(resolver
            .find(&source, ArtifactKind::Transformation, "de", None)
            .await
            .unwrap()
            .is_none());
        assert!(resolver
            .find(&source, ArtifactKind::Transcript, "de", None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lookups_do_not_write() {
        let (storage, source) = setup();
        let resolver = ArtifactResolver::new(storage.clone(), true);
        resolver
            .resolve(&source, "de", ArtifactKind::Transcript, None, true)
            .await
            .unwrap();
        assert_eq!(storage.writes(), 0);
    }
}
