//! File-backed paste record collection

use std::{
    collections::{BTreeMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    fs,
    sync::{RwLock, RwLockReadGuard},
};
use tracing::{debug, info};

use crate::{config::DatabaseConfig, error::StoreError};

/// A stored paste. `image` names a file in the upload directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasteRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PasteRecord {
    /// A record is live until its expiry passes. Records without expiry never expire.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Contents {
    records: BTreeMap<String, PasteRecord>,
    /// Other collections in the same document, preserved untouched on write.
    others: Map<String, Value>,
}

/// Record collection stored as a JSON document on disk.
///
/// The document is an object keyed by collection name; this handle owns one
/// collection. All writes go through a temp file and an atomic rename.
#[derive(Debug)]
pub struct PasteDb {
    path: PathBuf,
    collection: String,
    contents: RwLock<Contents>,
}

/// Read access to the records, held while checking and deleting a resource.
///
/// Writers wait for the guard to drop, so a record cannot start referencing
/// an image between the reference check and the file removal.
pub struct ReferenceGuard<'a> {
    contents: RwLockReadGuard<'a, Contents>,
}

impl ReferenceGuard<'_> {
    /// Whether any live record references `image`.
    pub fn is_referenced(&self, image: &str, now: DateTime<Utc>) -> bool {
        self.contents
            .records
            .values()
            .any(|r| r.is_live(now) && r.image.as_deref() == Some(image))
    }
}

impl PasteDb {
    /// Open the collection, creating an empty document if none exists yet.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let path = config.path.clone();
        let contents = match fs::read(&path).await {
            Ok(bytes) => Self::decode(&path, &bytes, &config.collection)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StoreError::io(parent, e))?;
                }
                Contents::default()
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        info!(
            path = %path.display(),
            collection = %config.collection,
            records = contents.records.len(),
            "Paste database opened"
        );

        let db = Self {
            path,
            collection: config.collection.clone(),
            contents: RwLock::new(contents),
        };
        {
            let contents = db.contents.read().await;
            db.persist(&contents.records, &contents.others).await?;
        }
        Ok(db)
    }

    fn decode(path: &Path, bytes: &[u8], collection: &str) -> Result<Contents, StoreError> {
        let corrupt = |source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Contents::default());
        }

        let mut others: Map<String, Value> = serde_json::from_slice(bytes).map_err(corrupt)?;
        let records: Vec<PasteRecord> = match others.remove(collection) {
            Some(value) => serde_json::from_value(value).map_err(corrupt)?,
            None => Vec::new(),
        };

        Ok(Contents {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            others,
        })
    }

    async fn persist(
        &self,
        records: &BTreeMap<String, PasteRecord>,
        others: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut document = others.clone();
        let records: Vec<&PasteRecord> = records.values().collect();
        let value = serde_json::to_value(records).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        document.insert(self.collection.clone(), value);

        let bytes = serde_json::to_vec_pretty(&document).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.tmp_path();
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    /// The document and its temp sibling. Neither may be treated as an upload.
    pub fn files(&self) -> [PathBuf; 2] {
        [self.path.clone(), self.tmp_path()]
    }

    /// Insert or replace a record, returning the previous one.
    ///
    /// Memory only changes once the document is on disk.
    pub async fn insert(&self, record: PasteRecord) -> Result<Option<PasteRecord>, StoreError> {
        let mut contents = self.contents.write().await;
        debug!(id = %record.id, image = ?record.image, "Inserting paste record");
        let mut records = contents.records.clone();
        let previous = records.insert(record.id.clone(), record);
        self.persist(&records, &contents.others).await?;
        contents.records = records;
        Ok(previous)
    }

    /// Remove a record by id. On a failed write the record stays.
    pub async fn remove(&self, id: &str) -> Result<Option<PasteRecord>, StoreError> {
        let mut contents = self.contents.write().await;
        if !contents.records.contains_key(id) {
            return Ok(None);
        }
        let mut records = contents.records.clone();
        let removed = records.remove(id);
        self.persist(&records, &contents.others).await?;
        contents.records = records;
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Option<PasteRecord> {
        self.contents.read().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.contents.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Names of images referenced by records that have not expired.
    pub async fn live_images(&self, now: DateTime<Utc>) -> HashSet<String> {
        self.contents
            .read()
            .await
            .records
            .values()
            .filter(|r| r.is_live(now))
            .filter_map(|r| r.image.clone())
            .collect()
    }

    /// Hold read access to the records while acting on a referenced resource.
    pub async fn lock_references(&self) -> ReferenceGuard<'_> {
        ReferenceGuard {
            contents: self.contents.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config(dir: &Path) -> DatabaseConfig {
        DatabaseConfig {
            path: dir.join("db").join("paste.json"),
            collection: "pastes".to_string(),
        }
    }

    fn record(id: &str, image: Option<&str>, expires_at: Option<DateTime<Utc>>) -> PasteRecord {
        PasteRecord {
            id: id.to_string(),
            image: image.map(str::to_string),
            expires_at,
        }
    }

    #[tokio::test]
    async fn creates_missing_document_and_persists_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let db = PasteDb::open(&cfg).await.unwrap();
        assert!(db.is_empty().await);
        assert!(cfg.path.exists());

        db.insert(record("a", Some("a.png"), None)).await.unwrap();
        db.insert(record("b", None, None)).await.unwrap();
        drop(db);

        let reopened = PasteDb::open(&cfg).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(
            reopened.get("a").await.unwrap().image.as_deref(),
            Some("a.png")
        );

        assert!(reopened.remove("a").await.unwrap().is_some());
        assert!(reopened.remove("a").await.unwrap().is_none());
        assert!(reopened.get("a").await.is_none());
    }

    #[tokio::test]
    async fn preserves_other_collections() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::create_dir_all(cfg.path.parent().unwrap()).unwrap();
        std::fs::write(&cfg.path, r#"{"users": [{"name": "x"}], "pastes": []}"#).unwrap();

        let db = PasteDb::open(&cfg).await.unwrap();
        db.insert(record("a", None, None)).await.unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(&cfg.path).unwrap()).unwrap();
        assert_eq!(raw["users"][0]["name"], "x");
        assert_eq!(raw["pastes"][0]["id"], "a");
    }

    #[tokio::test]
    async fn corrupt_document_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::create_dir_all(cfg.path.parent().unwrap()).unwrap();
        std::fs::write(&cfg.path, "{ not json").unwrap();

        let err = PasteDb::open(&cfg).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    /// Swap the document for a non-empty directory so the rename fails.
    fn block_document(path: &Path) {
        std::fs::remove_file(path).unwrap();
        std::fs::create_dir(path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
    }

    #[tokio::test]
    async fn failed_write_leaves_records_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let db = PasteDb::open(&cfg).await.unwrap();
        db.insert(record("p", Some("img"), None)).await.unwrap();

        block_document(&cfg.path);

        assert!(db.remove("p").await.is_err());
        assert_eq!(db.get("p").await.unwrap().image.as_deref(), Some("img"));
        assert!(db.live_images(Utc::now()).await.contains("img"));

        assert!(db.insert(record("q", Some("other"), None)).await.is_err());
        assert!(db.get("q").await.is_none());
        assert_eq!(db.len().await, 1);
    }

    #[tokio::test]
    async fn files_name_the_document_and_its_temp_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let db = PasteDb::open(&cfg).await.unwrap();
        let [doc, tmp] = db.files();
        assert_eq!(doc, cfg.path);
        assert_eq!(tmp, dir.path().join("db").join("paste.tmp"));
    }

    #[tokio::test]
    async fn expired_records_do_not_reference_images() {
        let dir = tempfile::tempdir().unwrap();
        let db = PasteDb::open(&config(dir.path())).await.unwrap();
        let now = Utc::now();

        db.insert(record("live", Some("live.png"), Some(now + Duration::hours(1))))
            .await
            .unwrap();
        db.insert(record("old", Some("old.png"), Some(now - Duration::hours(1))))
            .await
            .unwrap();

        let live = db.live_images(now).await;
        assert!(live.contains("live.png"));
        assert!(!live.contains("old.png"));

        let guard = db.lock_references().await;
        assert!(guard.is_referenced("live.png", now));
        assert!(!guard.is_referenced("old.png", now));
        assert!(!guard.is_referenced("missing.png", now));
    }
}
