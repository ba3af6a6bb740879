//! In-memory [`StorageProvider`] implementation for testing.
//!
//! Items live in a `HashMap` behind `std::sync::RwLock`. Ids are random
//! UUIDs and survive moves. Write operations are counted so tests can
//! assert that a decision caused no side effects, and the backend can be
//! switched to "unavailable" to simulate a storage outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::PipelineError;

use super::{ItemKind, StorageItem, StorageProvider, ROOT_ID};

struct Node {
    item: StorageItem,
    content: Vec<u8>,
}

pub struct InMemoryStorage {
    nodes: RwLock<HashMap<String, Node>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID.to_string(),
            Node {
                item: StorageItem {
                    id: ROOT_ID.to_string(),
                    parent_id: String::new(),
                    name: String::new(),
                    kind: ItemKind::Folder,
                    size: 0,
                    mime_type: None,
                    modified_at: Utc::now(),
                },
                content: Vec::new(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            writes: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of mutating calls served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every call fail with a transient error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Synchronous setup helper: add a file without counting a write.
    pub fn seed_file(&self, parent_id: &str, name: &str, content: &[u8], mime_type: &str) -> StorageItem {
        let item = self.make_item(parent_id, name, ItemKind::File, content.len() as u64, Some(mime_type));
        self.nodes_mut().insert(
            item.id.clone(),
            Node {
                item: item.clone(),
                content: content.to_vec(),
            },
        );
        item
    }

    /// Synchronous setup helper: add a folder without counting a write.
    pub fn seed_folder(&self, parent_id: &str, name: &str) -> StorageItem {
        let item = self.make_item(parent_id, name, ItemKind::Folder, 0, None);
        self.nodes_mut().insert(
            item.id.clone(),
            Node {
                item: item.clone(),
                content: Vec::new(),
            },
        );
        item
    }

    fn make_item(
        &self,
        parent_id: &str,
        name: &str,
        kind: ItemKind,
        size: u64,
        mime_type: Option<&str>,
    ) -> StorageItem {
        StorageItem {
            id: Uuid::new_v4().to_string(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind,
            size,
            mime_type: mime_type.map(str::to_string),
            modified_at: Utc::now(),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::TransientProvider("memory storage unavailable".into()).into());
        }
        Ok(())
    }

    fn nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Node>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn require_folder(nodes: &HashMap<String, Node>, id: &str) -> Result<()> {
        match nodes.get(id) {
            Some(n) if n.item.is_folder() => Ok(()),
            Some(_) => Err(PipelineError::BadRequest(format!("not a folder: {}", id)).into()),
            None => Err(PipelineError::NotFound(format!("folder {}", id)).into()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<StorageItem>> {
        self.check_available()?;
        let nodes = self.nodes();
        Self::require_folder(&nodes, folder_id)?;
        let mut children: Vec<StorageItem> = nodes
            .values()
            .filter(|n| n.item.parent_id == folder_id && n.item.id != ROOT_ID)
            .map(|n| n.item.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn get_item(&self, id: &str) -> Result<Option<StorageItem>> {
        self.check_available()?;
        Ok(self.nodes().get(id).map(|n| n.item.clone()))
    }

    async fn get_binary(&self, id: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        self.nodes()
            .get(id)
            .filter(|n| n.item.is_file())
            .map(|n| n.content.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("file {}", id)).into())
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<StorageItem> {
        self.check_available()?;
        let mut nodes = self.nodes_mut();
        Self::require_folder(&nodes, parent_id)?;
        if let Some(existing) = nodes
            .values()
            .find(|n| n.item.parent_id == parent_id && n.item.name == name && n.item.is_folder())
        {
            return Ok(existing.item.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let item = self.make_item(parent_id, name, ItemKind::Folder, 0, None);
        nodes.insert(
            item.id.clone(),
            Node {
                item: item.clone(),
                content: Vec::new(),
            },
        );
        Ok(item)
    }

    async fn upload_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
        mime_type: &str,
    ) -> Result<StorageItem> {
        self.check_available()?;
        let mut nodes = self.nodes_mut();
        Self::require_folder(&nodes, parent_id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let existing_id = nodes
            .values()
            .find(|n| n.item.parent_id == parent_id && n.item.name == name && n.item.is_file())
            .map(|n| n.item.id.clone());

        let item = match existing_id.and_then(|id| nodes.get_mut(&id)) {
            Some(node) => {
                node.content = content.to_vec();
                node.item.size = content.len() as u64;
                node.item.mime_type = Some(mime_type.to_string());
                node.item.modified_at = Utc::now();
                node.item.clone()
            }
            None => {
                let item = self.make_item(
                    parent_id,
                    name,
                    ItemKind::File,
                    content.len() as u64,
                    Some(mime_type),
                );
                nodes.insert(
                    item.id.clone(),
                    Node {
                        item: item.clone(),
                        content: content.to_vec(),
                    },
                );
                item
            }
        };
        Ok(item)
    }

    async fn move_item(&self, id: &str, new_parent_id: &str) -> Result<StorageItem> {
        self.check_available()?;
        let mut nodes = self.nodes_mut();
        Self::require_folder(&nodes, new_parent_id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(format!("item {}", id)))?;
        node.item.parent_id = new_parent_id.to_string();
        node.item.modified_at = Utc::now();
        Ok(node.item.clone())
    }

    async fn delete_item(&self, id: &str) -> Result<()> {
        self.check_available()?;
        if id == ROOT_ID {
            return Err(PipelineError::BadRequest("cannot delete the root folder".into()).into());
        }
        let mut nodes = self.nodes_mut();
        if nodes.remove(id).is_none() {
            return Err(PipelineError::NotFound(format!("item {}", id)).into());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        // Children of a deleted folder go with it.
        let mut orphans: Vec<String> = vec![id.to_string()];
        while let Some(parent) = orphans.pop() {
            let children: Vec<String> = nodes
                .values()
                .filter(|n| n.item.parent_id == parent)
                .map(|n| n.item.id.clone())
                .collect();
            for child in children {
                nodes.remove(&child);
                orphans.push(child);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_replaces_same_named_file() {
        let storage = InMemoryStorage::new();
        let a = storage
            .upload_file(ROOT_ID, "a.md", b"one", "text/markdown")
            .await
            .unwrap();
        let b = storage
            .upload_file(ROOT_ID, "a.md", b"two", "text/markdown")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(storage.list_children(ROOT_ID).await.unwrap().len(), 1);
        assert_eq!(storage.get_text(&a.id).await.unwrap(), "two");
        assert_eq!(storage.writes(), 2);
    }

    #[tokio::test]
    async fn create_folder_is_idempotent() {
        let storage = InMemoryStorage::new();
        let f1 = storage.create_folder(ROOT_ID, ".a.pdf").await.unwrap();
        let f2 = storage.create_folder(ROOT_ID, ".a.pdf").await.unwrap();
        assert_eq!(f1.id, f2.id);
        assert_eq!(storage.writes(), 1);
    }

    #[tokio::test]
    async fn move_keeps_id_and_reparents() {
        let storage = InMemoryStorage::new();
        let folder = storage.seed_folder(ROOT_ID, "dest");
        let file = storage.seed_file(ROOT_ID, "x.md", b"x", "text/markdown");
        let moved = storage.move_item(&file.id, &folder.id).await.unwrap();
        assert_eq!(moved.id, file.id);
        assert_eq!(storage.list_children(&folder.id).await.unwrap().len(), 1);
        assert!(storage.find_child(ROOT_ID, "x.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_backend_returns_transient_errors() {
        let storage = InMemoryStorage::new();
        storage.set_unavailable(true);
        let err = storage.list_children(ROOT_ID).await.unwrap_err();
        assert_eq!(crate::error::error_code(&err), "transient_provider");
    }

    #[tokio::test]
    async fn delete_folder_removes_children() {
        let storage = InMemoryStorage::new();
        let folder = storage.seed_folder(ROOT_ID, "f");
        let file = storage.seed_file(&folder.id, "inner.md", b"", "text/markdown");
        storage.delete_item(&folder.id).await.unwrap();
        assert!(storage.get_item(&file.id).await.unwrap().is_none());
    }
}
