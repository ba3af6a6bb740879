//! Library facet schemas.
//!
//! A facet is a library-specific metadata field with a declared type. The
//! [`FacetSchemaProvider`] is the external collaborator serving them; the
//! [`FacetSchemaCache`] memoizes its answers per library and is injected
//! wherever schemas are read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Declared type of a facet field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacetType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "boolean")]
    Boolean,
}

/// One declared facet field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetDef {
    pub name: String,
    #[serde(rename = "type")]
    pub facet_type: FacetType,
}

/// Source of per-library facet declarations.
#[async_trait]
pub trait FacetSchemaProvider: Send + Sync {
    /// Facet declarations for a library, or `None` if the library is unknown
    /// to this user.
    async fn facets(&self, user_email: &str, library_id: &str) -> Result<Option<Vec<FacetDef>>>;
}

/// Provider backed by a fixed map, used by config-driven deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFacetSchemas {
    libraries: HashMap<String, StaticLibrary>,
}

#[derive(Debug, Clone)]
struct StaticLibrary {
    owner: Option<String>,
    facets: Vec<FacetDef>,
}

impl StaticFacetSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a library. With `owner` set, other users don't see it.
    pub fn insert(&mut self, library_id: &str, owner: Option<String>, facets: Vec<FacetDef>) {
        self.libraries
            .insert(library_id.to_string(), StaticLibrary { owner, facets });
    }
}

#[async_trait]
impl FacetSchemaProvider for StaticFacetSchemas {
    async fn facets(&self, user_email: &str, library_id: &str) -> Result<Option<Vec<FacetDef>>> {
        Ok(self.libraries.get(library_id).and_then(|lib| match &lib.owner {
            Some(owner) if !owner.eq_ignore_ascii_case(user_email) => None,
            _ => Some(lib.facets.clone()),
        }))
    }
}

/// Memoizing wrapper around a [`FacetSchemaProvider`].
///
/// Entries are keyed by `(user_email, library_id)`. Call
/// [`invalidate`](FacetSchemaCache::invalidate) whenever a library's
/// schema is edited.
pub struct FacetSchemaCache {
    provider: Arc<dyn FacetSchemaProvider>,
    entries: RwLock<HashMap<(String, String), Option<Vec<FacetDef>>>>,
}

impl FacetSchemaCache {
    pub fn new(provider: Arc<dyn FacetSchemaProvider>) -> Self {
        Self {
            provider,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, user_email: &str, library_id: &str) -> Result<Option<Vec<FacetDef>>> {
        let key = (user_email.to_string(), library_id.to_string());
        let cached = self.read_entries().get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let fetched = self.provider.facets(user_email, library_id).await?;
        self.write_entries().insert(key, fetched.clone());
        Ok(fetched)
    }

    /// Drop every cached entry for a library.
    pub fn invalidate(&self, library_id: &str) {
        self.write_entries().retain(|(_, lib), _| lib != library_id);
    }

    pub fn invalidate_all(&self) {
        self.write_entries().clear();
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entries(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), Option<Vec<FacetDef>>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), Option<Vec<FacetDef>>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FacetSchemaProvider for CountingProvider {
        async fn facets(&self, _user: &str, library_id: &str) -> Result<Option<Vec<FacetDef>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(vec![FacetDef {
                name: format!("{}-facet", library_id),
                facet_type: FacetType::String,
            }]))
        }
    }

    #[tokio::test]
    async fn cache_memoizes_until_invalidated() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = FacetSchemaCache::new(provider.clone());

        cache.get("a@example.com", "lib1").await.unwrap();
        cache.get("a@example.com", "lib1").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        cache.invalidate("lib1");
        assert!(cache.is_empty());
        cache.get("a@example.com", "lib1").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn static_schemas_respect_owner() {
        let mut schemas = StaticFacetSchemas::new();
        schemas.insert("lib", Some("owner@example.com".to_string()), vec![]);
        assert!(schemas.facets("owner@example.com", "lib").await.unwrap().is_some());
        assert!(schemas.facets("other@example.com", "lib").await.unwrap().is_none());
        assert!(schemas.facets("owner@example.com", "missing").await.unwrap().is_none());
    }

    #[test]
    fn facet_type_uses_wire_names() {
        let def: FacetDef = serde_json::from_str(r#"{"name":"authors","type":"string[]"}"#).unwrap();
        assert_eq!(def.facet_type, FacetType::StringArray);
    }
}
