//! Image store
//!
//! The narrow read/write contract the pipeline consumes, plus the default
//! on-disk implementation: originals under one directory, metadata in a
//! JSON index. Deleted URLs stay blocked so they are never re-downloaded.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::types::image::{Caption, ImageRecord};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("url already stored or blocked: {0}")]
    Duplicate(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Metadata accompanying the bytes of a new image.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub url: String,
    pub source: String,
    pub source_id: Option<String>,
    pub query: String,
    pub tags: Vec<String>,
    pub alt: String,
}

/// The store contract consumed by the pipeline stages.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist image bytes and their metadata, returning the new record.
    async fn save(&self, bytes: &[u8], request: SaveRequest) -> Result<ImageRecord, StoreError>;

    async fn get(&self, id: &str) -> Result<ImageRecord, StoreError>;

    /// Apply a caption to a stored image: sets the caption text and merges
    /// detected object labels into the tag list.
    async fn update_caption(&self, id: &str, caption: &Caption) -> Result<(), StoreError>;

    /// Images without a caption, newest first. Empty `sources` means all.
    async fn list_unprocessed(
        &self,
        limit: usize,
        sources: &[String],
    ) -> Result<Vec<ImageRecord>, StoreError>;

    /// Read the original file bytes for a record.
    async fn read_bytes(&self, record: &ImageRecord) -> Result<Vec<u8>, StoreError>;

    /// Whether a URL is already stored or blocked.
    async fn contains_url(&self, url: &str) -> bool;

    /// Remove an image and block its URL from future downloads.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    images: Vec<ImageRecord>,
    blocked_urls: Vec<String>,
}

struct StoreInner {
    images: HashMap<String, ImageRecord>,
    urls: HashSet<String>,
    blocked: HashSet<String>,
}

/// On-disk store: `<root>/originals/` for files, `<root>/index.json` for
/// metadata.
pub struct JsonImageStore {
    root: PathBuf,
    originals: PathBuf,
    inner: Mutex<StoreInner>,
}

impl JsonImageStore {
    /// Open (or initialize) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let originals = root.join("originals");
        std::fs::create_dir_all(&originals)?;

        let index_path = root.join("index.json");
        let index: IndexFile = if index_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)?
        } else {
            IndexFile::default()
        };

        let mut images = HashMap::new();
        let mut urls = HashSet::new();
        for record in index.images {
            urls.insert(record.url.clone());
            images.insert(record.id.clone(), record);
        }
        let blocked: HashSet<String> = index.blocked_urls.into_iter().collect();

        tracing::info!(
            "Image store opened at {} ({} images, {} blocked urls)",
            root.display(),
            images.len(),
            blocked.len()
        );

        Ok(Self {
            root,
            originals,
            inner: Mutex::new(StoreInner {
                images,
                urls,
                blocked,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, inner: &StoreInner) -> Result<(), StoreError> {
        let mut images: Vec<ImageRecord> = inner.images.values().cloned().collect();
        images.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        let mut blocked_urls: Vec<String> = inner.blocked.iter().cloned().collect();
        blocked_urls.sort();

        let index = IndexFile {
            images,
            blocked_urls,
        };
        let json = serde_json::to_string_pretty(&index)?;
        std::fs::write(self.root.join("index.json"), json)?;
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Build a filename from the first few tags, like `lake_sunset_a1b2c3d4.jpg`.
fn generate_filename(tags: &[String], ext: &str) -> String {
    let safe_tags: Vec<String> = tags
        .iter()
        .filter(|t| !t.trim().is_empty())
        .take(3)
        .map(|t| {
            t.to_lowercase()
                .replace(' ', "_")
                .chars()
                .take(15)
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect()
        })
        .collect();

    let stem = if safe_tags.is_empty() {
        "image".to_string()
    } else {
        safe_tags.join("_")
    };

    let unique = Uuid::new_v4().simple().to_string();
    format!("{}_{}{}", stem, &unique[..8], ext)
}

/// Pick a file extension from magic bytes; jpeg is the common case.
fn extension_for(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        ".png"
    } else {
        ".jpg"
    }
}

#[async_trait]
impl ImageStore for JsonImageStore {
    async fn save(&self, bytes: &[u8], request: SaveRequest) -> Result<ImageRecord, StoreError> {
        {
            let inner = self.lock();
            if inner.urls.contains(&request.url) || inner.blocked.contains(&request.url) {
                return Err(StoreError::Duplicate(request.url));
            }
        }

        let filename = generate_filename(&request.tags, extension_for(bytes));
        let rel_path = PathBuf::from("originals").join(&filename);
        tokio::fs::write(self.originals.join(&filename), bytes).await?;

        let record = ImageRecord {
            id: Uuid::new_v4().to_string(),
            url: request.url.clone(),
            source: request.source,
            source_id: request.source_id,
            query: request.query,
            path: Some(rel_path),
            thumb_path: None,
            caption: if request.alt.trim().is_empty() {
                None
            } else {
                Some(request.alt)
            },
            tags: request.tags,
            size_bytes: bytes.len() as u64,
            downloaded_at: Utc::now(),
        };

        let saved = {
            let mut inner = self.lock();
            // A concurrent save of the same URL may have won the race
            // between the pre-check and here.
            if !inner.urls.insert(record.url.clone()) {
                None
            } else {
                inner.images.insert(record.id.clone(), record.clone());
                self.persist(&inner)?;
                Some(record)
            }
        };

        match saved {
            Some(record) => Ok(record),
            None => {
                tokio::fs::remove_file(self.originals.join(&filename)).await.ok();
                Err(StoreError::Duplicate(request.url))
            }
        }
    }

    async fn get(&self, id: &str) -> Result<ImageRecord, StoreError> {
        self.lock()
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_caption(&self, id: &str, caption: &Caption) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let record = inner
            .images
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        record.caption = Some(caption.text.clone());

        // New labels first, then surviving existing tags.
        let lower: HashSet<String> = caption.objects.iter().map(|t| t.to_lowercase()).collect();
        let mut tags = caption.objects.clone();
        tags.extend(
            record
                .tags
                .iter()
                .filter(|t| !lower.contains(&t.to_lowercase()))
                .cloned(),
        );
        record.tags = tags;

        self.persist(&inner)?;
        Ok(())
    }

    async fn list_unprocessed(
        &self,
        limit: usize,
        sources: &[String],
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let sources_lower: Vec<String> = sources.iter().map(|s| s.to_lowercase()).collect();
        let mut records: Vec<ImageRecord> = self
            .lock()
            .images
            .values()
            .filter(|r| r.caption.is_none())
            .filter(|r| {
                sources_lower.is_empty() || sources_lower.contains(&r.source.to_lowercase())
            })
            .cloned()
            .collect();

        records.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn read_bytes(&self, record: &ImageRecord) -> Result<Vec<u8>, StoreError> {
        let path = record
            .path
            .as_ref()
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        Ok(tokio::fs::read(self.resolve(path)).await?)
    }

    async fn contains_url(&self, url: &str) -> bool {
        let inner = self.lock();
        inner.urls.contains(url) || inner.blocked.contains(url)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let record = {
            let mut inner = self.lock();
            let record = inner
                .images
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            inner.urls.remove(&record.url);
            inner.blocked.insert(record.url.clone());
            self.persist(&inner)?;
            record
        };

        // Thumbnails may exist in indexes written by other tools.
        for path in [&record.path, &record.thumb_path].into_iter().flatten() {
            if let Err(e) = tokio::fs::remove_file(self.resolve(path)).await {
                tracing::warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}
