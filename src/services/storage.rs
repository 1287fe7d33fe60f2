//! Upload directory and the orphan-resource contract used by the reaper

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use super::PasteDb;
use crate::error::StoreError;

/// What the reaper needs from the persistence layer.
///
/// Implementations must make `remove_orphan` safe under concurrent readers
/// and writers: re-check the orphan rule and delete only if it still holds.
#[async_trait]
pub trait ResourceCollection: Send + Sync {
    /// Identifiers of stored resources that currently look orphaned.
    async fn orphan_candidates(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Delete `id` if it is still orphaned. `Ok(false)` means it was skipped.
    async fn remove_orphan(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// Uploaded images on disk, cross-checked against the paste records.
///
/// A file is orphaned when no live record references it: either no record
/// names it, or every record naming it has expired.
#[derive(Debug, Clone)]
pub struct ImageCollection {
    db: Arc<PasteDb>,
    upload_dir: PathBuf,
}

impl ImageCollection {
    pub fn new(db: Arc<PasteDb>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, StoreError> {
        let plain = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.contains('\0');
        if !plain {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.upload_dir.join(id))
    }
}

/// Make sure the upload directory exists.
pub async fn ensure_upload_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path).await
}

#[async_trait]
impl ResourceCollection for ImageCollection {
    async fn orphan_candidates(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let live = self.db.live_images(now).await;
        let reserved = self.db.files();
        let mut entries = fs::read_dir(&self.upload_dir)
            .await
            .map_err(|e| StoreError::io(&self.upload_dir, e))?;

        let mut candidates = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.upload_dir, e))?
        {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                // Removed between listing and stat.
                Err(_) => continue,
            };
            if !file_type.is_file() || reserved.contains(&entry.path()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                continue;
            };
            if !live.contains(&name) {
                candidates.push(name);
            }
        }

        candidates.sort();
        Ok(candidates)
    }

    async fn remove_orphan(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let path = self.resolve(id)?;
        if self.db.files().contains(&path) {
            return Ok(false);
        }
        let references = self.db.lock_references().await;
        if references.is_referenced(id, now) {
            debug!(image = %id, "Image became referenced, keeping it");
            return Ok(false);
        }

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            // Already gone: nothing left to reclaim.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}
