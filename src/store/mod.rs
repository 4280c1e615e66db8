//! On-disk layout of content entries.
//!
//! Every entry owns `{base}/{content_id}/` containing up to three files:
//! `source.jpg`/`source.png`, `target.jpg`, and `meta`. The Store only ever
//! touches the filesystem — it knows nothing about HTTP, subprocesses, or
//! the job state machine that drives an entry through its lifecycle.

pub mod meta;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{AppError, AppResult};
pub use meta::{Metadata, SourceType, Status};

const SOURCE_STEM: &str = "source";
const TARGET_FILENAME: &str = "target.jpg";
const META_FILENAME: &str = "meta";

#[derive(Clone)]
pub struct Store {
    base: PathBuf,
}

impl Store {
    pub fn new(base: PathBuf) -> Self {
        Store { base }
    }

    /// Ensures the base directory exists. Called once at startup; entry
    /// subdirectories are created lazily by `admit`.
    pub async fn ensure_base_dir(&self) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        Ok(())
    }

    fn entry_dir(&self, content_id: &str) -> PathBuf {
        self.base.join(content_id)
    }

    fn source_path(&self, content_id: &str, source_type: SourceType) -> PathBuf {
        self.entry_dir(content_id)
            .join(format!("{SOURCE_STEM}.{}", source_type.extension()))
    }

    fn target_path(&self, content_id: &str) -> PathBuf {
        self.entry_dir(content_id).join(TARGET_FILENAME)
    }

    fn meta_path(&self, content_id: &str) -> PathBuf {
        self.entry_dir(content_id).join(META_FILENAME)
    }

    /// Path to the source file for a known source type — used by the job
    /// pipeline, which always has the type in hand from the freshly admitted
    /// entry rather than needing to probe the filesystem for it.
    pub fn source_path_for(&self, content_id: &str, source_type: SourceType) -> PathBuf {
        self.source_path(content_id, source_type)
    }

    pub fn target_path_for(&self, content_id: &str) -> PathBuf {
        self.target_path(content_id)
    }

    /// Generates a fresh content id, creates its directory, and writes the
    /// uploaded bytes to `source.<ext>`. Does not write metadata — the
    /// caller completes admission with `write_meta`.
    pub async fn admit(&self, data: &[u8], source_type: SourceType) -> AppResult<String> {
        let content_id = Uuid::new_v4().simple().to_string();
        let dir = self.entry_dir(&content_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.source_path(&content_id, source_type);
        tokio::fs::write(&path, data).await?;
        Ok(content_id)
    }

    pub async fn read_source(&self, content_id: &str) -> AppResult<Vec<u8>> {
        for source_type in [SourceType::Jpg, SourceType::Png] {
            let path = self.source_path(content_id, source_type);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(tokio::fs::read(&path).await?);
            }
        }
        Err(AppError::NotFound)
    }

    pub async fn read_target(&self, content_id: &str) -> AppResult<Vec<u8>> {
        let path = self.target_path(content_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AppError::NotFound);
        }
        Ok(tokio::fs::read(&path).await?)
    }

    pub async fn write_target(&self, content_id: &str, data: &[u8]) -> AppResult<()> {
        let path = self.target_path(content_id);
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    pub async fn read_meta(&self, content_id: &str) -> AppResult<Metadata> {
        let path = self.meta_path(content_id);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| AppError::NotFound)?;
        meta::parse(&raw).map_err(|e| AppError::Internal(format!("corrupt metadata: {e}")))
    }

    pub async fn write_meta(&self, record: &Metadata) -> AppResult<()> {
        let dir = self.entry_dir(&record.content_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.meta_path(&record.content_id);
        let text = meta::serialize(record);
        tokio::fs::write(&path, text).await?;
        Ok(())
    }

    /// Enumerates every content id currently on disk. Order is unspecified.
    pub async fn list_content_ids(&self) -> AppResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Recursively removes a content id's directory. A no-op if it is
    /// already gone; per-file failures during the walk are swallowed so a
    /// single locked or missing file never wedges the sweep.
    pub async fn delete(&self, content_id: &str) -> AppResult<()> {
        let dir = self.entry_dir(content_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(());
        }
        remove_dir_tree_best_effort(&dir).await;
        Ok(())
    }
}

/// Removes files depth-first, logging and continuing past individual
/// failures, then removes the directory itself. Mirrors spec section 4.1's
/// "swallow per-file failures, final post-visit removes the directory".
async fn remove_dir_tree_best_effort(dir: &Path) {
    let mut stack = vec![dir.to_path_buf()];
    let mut dirs_in_order = Vec::new();

    while let Some(current) = stack.pop() {
        dirs_in_order.push(current.clone());
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(path = %current.display(), error = %e, "failed to read directory during delete");
                continue;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    if is_dir {
                        stack.push(path);
                    } else if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove file during delete");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read directory entry during delete");
                    break;
                }
            }
        }
    }

    for dir in dirs_in_order.into_iter().rev() {
        if let Err(e) = tokio::fs::remove_dir(&dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove directory during delete");
        }
    }
}
