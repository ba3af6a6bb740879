//! Storage abstraction for docflow.
//!
//! The [`StorageProvider`] trait is the only view the orchestration core
//! has of a document library. Backends (local filesystem, in-memory, cloud
//! drives) implement it uniformly; nothing upstream branches on the
//! backend type.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Id of the library root folder in every backend.
pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
}

/// Metadata for one file or folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageItem {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mime_type: Option<String>,
    pub modified_at: DateTime<Utc>,
}

impl StorageItem {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }
}

/// Abstract document library backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list_children`](StorageProvider::list_children) | Direct children of a folder |
/// | [`get_item`](StorageProvider::get_item) | Metadata by id |
/// | [`get_binary`](StorageProvider::get_binary) | File content |
/// | [`create_folder`](StorageProvider::create_folder) | New folder (returns existing one with the same name) |
/// | [`upload_file`](StorageProvider::upload_file) | Write a file, replacing a same-named sibling |
/// | [`move_item`](StorageProvider::move_item) | Reparent an item |
/// | [`delete_item`](StorageProvider::delete_item) | Remove an item |
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend name for logs (`"local"`, `"memory"`).
    fn backend(&self) -> &str;

    async fn list_children(&self, folder_id: &str) -> Result<Vec<StorageItem>>;

    async fn get_item(&self, id: &str) -> Result<Option<StorageItem>>;

    async fn get_binary(&self, id: &str) -> Result<Vec<u8>>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<StorageItem>;

    async fn upload_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
        mime_type: &str,
    ) -> Result<StorageItem>;

    /// Move an item under `new_parent_id`, keeping its name. Backends whose
    /// ids encode the path return the item under its new id.
    async fn move_item(&self, id: &str, new_parent_id: &str) -> Result<StorageItem>;

    async fn delete_item(&self, id: &str) -> Result<()>;

    /// File content decoded as UTF-8 (lossy).
    async fn get_text(&self, id: &str) -> Result<String> {
        let bytes = self.get_binary(id).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Child of `folder_id` with exactly this name.
    async fn find_child(&self, folder_id: &str, name: &str) -> Result<Option<StorageItem>> {
        Ok(self
            .list_children(folder_id)
            .await?
            .into_iter()
            .find(|item| item.name == name))
    }
}
