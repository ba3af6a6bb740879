//! Local-filesystem storage backend.
//!
//! Item ids are paths relative to the configured library root, joined
//! with `/`; the root itself is [`ROOT_ID`]. Moving an item changes its id.
//! [`scan_sources`] walks the library for `docflow enqueue-dir`, skipping
//! shadow folders and any other dot-directory.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use docflow_core::error::PipelineError;
use docflow_core::storage::{ItemKind, StorageItem, StorageProvider, ROOT_ID};

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("storage root does not exist: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        if id == ROOT_ID || id.is_empty() {
            return Ok(self.root.clone());
        }
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(PipelineError::BadRequest(format!("invalid item id: {}", id)).into());
        }
        Ok(self.root.join(relative))
    }

    fn id_for(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ROOT_ID.to_string(),
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => path.to_string_lossy().to_string(),
        }
    }

    async fn item_at(&self, path: &Path) -> Result<StorageItem> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| io_error(e, path))?;
        let id = self.id_for(path);
        let parent_id = match id.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None if id == ROOT_ID => String::new(),
            None => ROOT_ID.to_string(),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let modified_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let kind = if metadata.is_dir() {
            ItemKind::Folder
        } else {
            ItemKind::File
        };
        let mime_type = (kind == ItemKind::File).then(|| mime_for(&name).to_string());

        Ok(StorageItem {
            id,
            parent_id,
            name,
            kind,
            size: metadata.len(),
            mime_type,
            modified_at,
        })
    }

    async fn require_dir(&self, id: &str) -> Result<PathBuf> {
        let path = self.resolve(id)?;
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_dir() => Ok(path),
            Ok(_) => Err(PipelineError::BadRequest(format!("not a folder: {}", id)).into()),
            Err(e) => Err(io_error(e, &path)),
        }
    }
}

fn io_error(err: std::io::Error, path: &Path) -> anyhow::Error {
    match err.kind() {
        ErrorKind::NotFound => PipelineError::NotFound(path.display().to_string()).into(),
        _ => PipelineError::TransientProvider(format!("{}: {}", path.display(), err)).into(),
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PipelineError::BadRequest(format!("invalid file name: {:?}", name)).into());
    }
    Ok(())
}

/// MIME type from the file extension.
pub fn mime_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("md") | Some("markdown") => "text/markdown",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn backend(&self) -> &str {
        "local"
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<StorageItem>> {
        let dir = self.require_dir(folder_id).await?;
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| io_error(e, &dir))?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(e, &dir))? {
            items.push(self.item_at(&entry.path()).await?);
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn get_item(&self, id: &str) -> Result<Option<StorageItem>> {
        let path = self.resolve(id)?;
        match self.item_at(&path).await {
            Ok(item) => Ok(Some(item)),
            Err(e) if docflow_core::error::error_code(&e) == "not_found" => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_binary(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.resolve(id)?;
        tokio::fs::read(&path).await.map_err(|e| io_error(e, &path))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<StorageItem> {
        check_name(name)?;
        let parent = self.require_dir(parent_id).await?;
        let path = parent.join(name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error(e, &path))?;
        self.item_at(&path).await
    }

    async fn upload_file(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
        _mime_type: &str,
    ) -> Result<StorageItem> {
        check_name(name)?;
        let parent = self.require_dir(parent_id).await?;
        let path = parent.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error(e, &path))?;
        self.item_at(&path).await
    }

    async fn move_item(&self, id: &str, new_parent_id: &str) -> Result<StorageItem> {
        let from = self.resolve(id)?;
        let name = from
            .file_name()
            .ok_or_else(|| PipelineError::BadRequest(format!("cannot move {}", id)))?
            .to_owned();
        let to = self.require_dir(new_parent_id).await?.join(name);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(e, &from))?;
        self.item_at(&to).await
    }

    async fn delete_item(&self, id: &str) -> Result<()> {
        if id == ROOT_ID {
            return Err(PipelineError::BadRequest("cannot delete the library root".into()).into());
        }
        let path = self.resolve(id)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| io_error(e, &path))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| io_error(e, &path))
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Default source patterns for `enqueue-dir`.
pub fn default_include_globs() -> Vec<String> {
    ["**/*.pdf", "**/*.docx", "**/*.pptx", "**/*.xlsx", "**/*.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Source files under `folder` (relative to `root`) matching `include`.
///
/// Returns storage ids sorted for deterministic ordering.
pub fn scan_sources(root: &Path, folder: &str, include: &[String]) -> Result<Vec<String>> {
    let start = if folder == ROOT_ID || folder.is_empty() {
        root.to_path_buf()
    } else {
        root.join(folder)
    };
    if !start.is_dir() {
        bail!("folder does not exist: {}", start.display());
    }

    let include_set = build_globset(include)?;
    let mut ids = Vec::new();

    let walker = WalkDir::new(&start)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if include_set.is_match(&rel_str) {
            ids.push(rel_str);
        }
    }

    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ids_are_relative_paths() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/a.pdf"), b"%PDF").unwrap();
        let storage = LocalStorage::new(tmp.path()).unwrap();

        let item = storage.get_item("docs/a.pdf").await.unwrap().unwrap();
        assert_eq!(item.parent_id, "docs");
        assert_eq!(item.mime_type.as_deref(), Some("application/pdf"));
        let docs = storage.get_item("docs").await.unwrap().unwrap();
        assert_eq!(docs.parent_id, ROOT_ID);
        assert!(storage.get_item("docs/missing.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shadow_round_trip_through_filesystem() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.pdf"), b"%PDF").unwrap();
        let storage = LocalStorage::new(tmp.path()).unwrap();

        let folder = storage.create_folder(ROOT_ID, ".a.pdf").await.unwrap();
        assert_eq!(folder.id, ".a.pdf");
        let file = storage
            .upload_file(&folder.id, "a.de.md", b"hello", "text/markdown")
            .await
            .unwrap();
        assert_eq!(file.id, ".a.pdf/a.de.md");
        assert_eq!(storage.get_text(&file.id).await.unwrap(), "hello");

        let moved = storage.move_item(&file.id, ROOT_ID).await.unwrap();
        assert_eq!(moved.id, "a.de.md");
        storage.delete_item(&moved.id).await.unwrap();
        assert!(storage.get_item("a.de.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn path_escapes_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path()).unwrap();
        assert!(storage.get_binary("../etc/passwd").await.is_err());
        assert!(storage.create_folder(ROOT_ID, "a/b").await.is_err());
    }

    #[test]
    fn scan_skips_shadow_folders() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(".a.pdf")).unwrap();
        std::fs::write(tmp.path().join(".a.pdf/inner.pdf"), b"").unwrap();
        std::fs::write(tmp.path().join("a.pdf"), b"").unwrap();
        std::fs::write(tmp.path().join("notes.md"), b"").unwrap();

        let ids = scan_sources(tmp.path(), ROOT_ID, &default_include_globs()).unwrap();
        assert_eq!(ids, vec!["a.pdf".to_string()]);
    }
}
