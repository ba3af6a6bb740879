//! Detection and repair of partially complete artifacts.
//!
//! Two situations are reconciled here:
//!
//! - an artifact exists but its frontmatter lacks the core fields
//!   (`pages`, `chapters`). [`RepairReconciler::check`] reports it so the
//!   transform gate can run again even though "an artifact exists";
//! - a pre-migration sibling file `{base}.{lang}.md` lives next to the
//!   source. [`RepairReconciler::adopt_legacy`] moves it into the shadow
//!   folder, or deletes it when a different canonical artifact already
//!   exists.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::frontmatter;
use crate::models::SourceRef;
use crate::naming::{self, ArtifactKind};
use crate::resolver::{ArtifactResolver, ResolvedArtifact};

/// State of the canonical transformation artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairCheck {
    pub exists: bool,
    pub has_core: bool,
    pub needs_repair: bool,
    pub artifact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdoptionOutcome {
    NoLegacy,
    LegacyWithoutFrontmatter { legacy_id: String },
    Adopted {
        id: String,
        /// Plain shadow transcript that shared the legacy file's name.
        #[serde(skip_serializing_if = "Option::is_none")]
        replaced_transcript_id: Option<String>,
    },
    DeletedDuplicate { legacy_id: String, canonical_id: String },
    AlreadyCanonical { id: String },
}

impl AdoptionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdoptionOutcome::NoLegacy => "no_legacy",
            AdoptionOutcome::LegacyWithoutFrontmatter { .. } => "legacy_without_frontmatter",
            AdoptionOutcome::Adopted { .. } => "adopted",
            AdoptionOutcome::DeletedDuplicate { .. } => "deleted_duplicate",
            AdoptionOutcome::AlreadyCanonical { .. } => "already_canonical",
        }
    }

    /// Whether storage was modified.
    pub fn changed_storage(&self) -> bool {
        matches!(
            self,
            AdoptionOutcome::Adopted { .. } | AdoptionOutcome::DeletedDuplicate { .. }
        )
    }
}

/// `true` iff the text's frontmatter misses the core fields.
pub fn needs_repair_text(text: &str) -> bool {
    let analysis = frontmatter::analyze(text);
    !frontmatter::has_core(&analysis.meta)
}

pub struct RepairReconciler {
    resolver: Arc<ArtifactResolver>,
}

impl RepairReconciler {
    pub fn new(resolver: Arc<ArtifactResolver>) -> Self {
        Self { resolver }
    }

    /// Load the canonical transformation and check its core frontmatter.
    ///
    /// A missing artifact needs no repair; it simply does not exist.
    pub async fn check(
        &self,
        source: &SourceRef,
        language: &str,
        template: Option<&str>,
    ) -> Result<RepairCheck> {
        let found = self
            .resolver
            .find(source, ArtifactKind::Transformation, language, template)
            .await?;
        let Some(mut artifact) = found else {
            return Ok(RepairCheck {
                exists: false,
                has_core: false,
                needs_repair: false,
                artifact_id: None,
            });
        };
        self.resolver.load_content(&mut artifact).await?;
        Ok(Self::check_artifact(&artifact))
    }

    /// Same as [`check`](Self::check) for an artifact whose content is loaded.
    pub fn check_artifact(artifact: &ResolvedArtifact) -> RepairCheck {
        let text = artifact.content.as_deref().unwrap_or_default();
        let has_core = !needs_repair_text(text);
        RepairCheck {
            exists: true,
            has_core,
            needs_repair: !has_core,
            artifact_id: Some(artifact.id.clone()),
        }
    }

    /// Move a legacy sibling artifact into the shadow folder.
    pub async fn adopt_legacy(
        &self,
        source: &SourceRef,
        language: &str,
        template: Option<&str>,
    ) -> Result<AdoptionOutcome> {
        let storage = self.resolver.storage();
        let Some(legacy) = self.resolver.find_legacy(source, language).await? else {
            return Ok(AdoptionOutcome::NoLegacy);
        };

        let text = storage.get_text(&legacy.id).await?;
        if !frontmatter::analyze(&text).has_frontmatter {
            return Ok(AdoptionOutcome::LegacyWithoutFrontmatter {
                legacy_id: legacy.id,
            });
        }

        let canonical = self
            .resolver
            .find(source, ArtifactKind::Transformation, language, template)
            .await?;

        match canonical {
            Some(canonical) if canonical.id == legacy.id => {
                Ok(AdoptionOutcome::AlreadyCanonical { id: canonical.id })
            }
            Some(canonical) => {
                storage.delete_item(&legacy.id).await?;
                info!(
                    source = %source.name,
                    legacy = %legacy.id,
                    canonical = %canonical.id,
                    "deleted duplicate legacy artifact"
                );
                Ok(AdoptionOutcome::DeletedDuplicate {
                    legacy_id: legacy.id,
                    canonical_id: canonical.id,
                })
            }
            None => {
                let folder = self.resolver.ensure_shadow_folder(source).await?;
                // A plain transcript with the same name would collide.
                let name = naming::legacy_file_name(naming::base_name(&source.name), language);
                let replaced_transcript_id = match storage.find_child(&folder.id, &name).await? {
                    Some(existing) => {
                        storage.delete_item(&existing.id).await?;
                        info!(
                            source = %source.name,
                            transcript = %existing.id,
                            legacy = %legacy.id,
                            "replaced shadow transcript with legacy artifact"
                        );
                        Some(existing.id)
                    }
                    None => None,
                };
                let moved = storage.move_item(&legacy.id, &folder.id).await?;
                info!(source = %source.name, artifact = %moved.id, "adopted legacy artifact");
                Ok(AdoptionOutcome::Adopted {
                    id: moved.id,
                    replaced_transcript_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;
    use crate::storage::{StorageProvider, ROOT_ID};

    const COMPLETE: &str = "---\npages: 12\nchapters: [a, b, c]\n---\n\nBody";
    const NO_CHAPTERS: &str = "---\npages: 12\n---\n\nBody";

    fn setup() -> (Arc<InMemoryStorage>, RepairReconciler, SourceRef) {
        let storage = Arc::new(InMemoryStorage::new());
        let item = storage.seed_file(ROOT_ID, "report.pdf", b"%PDF", "application/pdf");
        let resolver = Arc::new(ArtifactResolver::new(storage.clone(), true));
        let source = SourceRef {
            item_id: item.id,
            parent_id: ROOT_ID.to_string(),
            name: "report.pdf".to_string(),
            mime_type: None,
        };
        (storage, RepairReconciler::new(resolver), source)
    }

    #[test]
    fn missing_core_fields_need_repair() {
        assert!(!needs_repair_text(COMPLETE));
        assert!(needs_repair_text(NO_CHAPTERS));
        assert!(needs_repair_text("---\npages: 0\nchapters: []\n---\n"));
        assert!(needs_repair_text("no frontmatter at all"));
    }

    #[tokio::test]
    async fn check_reports_incomplete_artifact() {
        let (storage, reconciler, source) = setup();
        let folder = storage.seed_folder(ROOT_ID, ".report.pdf");
        storage.seed_file(&folder.id, "report.default.de.md", NO_CHAPTERS.as_bytes(), "text/markdown");

        let check = reconciler.check(&source, "de", Some("default")).await.unwrap();
        assert!(check.exists);
        assert!(check.needs_repair);

        let absent = reconciler.check(&source, "en", Some("default")).await.unwrap();
        assert!(!absent.exists);
        assert!(!absent.needs_repair);
    }

    #[tokio::test]
    async fn legacy_is_moved_when_no_canonical_exists() {
        let (storage, reconciler, source) = setup();
        let legacy = storage.seed_file(ROOT_ID, "report.de.md", COMPLETE.as_bytes(), "text/markdown");

        let outcome = reconciler.adopt_legacy(&source, "de", Some("default")).await.unwrap();
        assert_eq!(
            outcome,
            AdoptionOutcome::Adopted {
                id: legacy.id.clone(),
                replaced_transcript_id: None,
            }
        );

        let moved = storage.get_item(&legacy.id).await.unwrap().unwrap();
        assert_ne!(moved.parent_id, ROOT_ID);
        assert!(storage.find_child(ROOT_ID, "report.de.md").await.unwrap().is_none());

        // A second pass finds nothing left to adopt.
        let again = reconciler.adopt_legacy(&source, "de", Some("default")).await.unwrap();
        assert_eq!(again, AdoptionOutcome::NoLegacy);
    }

    #[tokio::test]
    async fn legacy_duplicate_is_deleted() {
        let (storage, reconciler, source) = setup();
        let folder = storage.seed_folder(ROOT_ID, ".report.pdf");
        let canonical = storage.seed_file(
            &folder.id,
            "report.default.de.md",
            COMPLETE.as_bytes(),
            "text/markdown",
        );
        let legacy = storage.seed_file(ROOT_ID, "report.de.md", COMPLETE.as_bytes(), "text/markdown");

        let outcome = reconciler.adopt_legacy(&source, "de", Some("default")).await.unwrap();
        assert_eq!(
            outcome,
            AdoptionOutcome::DeletedDuplicate {
                legacy_id: legacy.id.clone(),
                canonical_id: canonical.id.clone(),
            }
        );
        assert!(storage.get_item(&legacy.id).await.unwrap().is_none());
        assert!(storage.get_item(&canonical.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn legacy_without_frontmatter_is_left_alone() {
        let (storage, reconciler, source) = setup();
        let legacy = storage.seed_file(ROOT_ID, "report.de.md", b"just text", "text/markdown");

        let outcome = reconciler.adopt_legacy(&source, "de", None).await.unwrap();
        assert!(matches!(outcome, AdoptionOutcome::LegacyWithoutFrontmatter { .. }));
        assert!(storage.get_item(&legacy.id).await.unwrap().is_some());
        assert_eq!(storage.writes(), 0);
    }

    #[tokio::test]
    async fn adoption_replaces_plain_transcript_of_same_name() {
        let (storage, reconciler, source) = setup();
        let folder = storage.seed_folder(ROOT_ID, ".report.pdf");
        let transcript = storage.seed_file(&folder.id, "report.de.md", b"plain", "text/markdown");
        let legacy = storage.seed_file(ROOT_ID, "report.de.md", COMPLETE.as_bytes(), "text/markdown");

        let outcome = reconciler.adopt_legacy(&source, "de", None).await.unwrap();
        assert_eq!(
            outcome,
            AdoptionOutcome::Adopted {
                id: legacy.id.clone(),
                replaced_transcript_id: Some(transcript.id.clone()),
            }
        );
        let recorded = serde_json::to_value(&outcome).unwrap();
        assert_eq!(recorded["outcome"], "adopted");
        assert_eq!(recorded["replaced_transcript_id"], transcript.id.as_str());
        assert!(storage.get_item(&transcript.id).await.unwrap().is_none());
        assert_eq!(storage.list_children(&folder.id).await.unwrap().len(), 1);
    }
}
