//! Metadata store for smartmarks
//!
//! Holds per-bookmark metadata (tags, summary, manual category) and the last
//! computed smart-category list. Every mutation is write-through: the new
//! document is flushed to the backend first and the in-memory view is only
//! swapped once the flush succeeded, so the two never drift apart.
//!
//! Smart categories are a disposable derived view and are replaced wholesale.
//! Bookmark metadata is user data and is only ever merged field by field.

pub mod backend;

use crate::bookmark::{Bookmark, BookmarkMeta, MetaUpdate, SmartCategory, SourceBookmark};
use crate::error::Result;
use anyhow::Context;
use backend::StorageBackend;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub use backend::{FileBackend, MemoryBackend};

const BOOKMARK_META_KEY: &str = "bookmark_meta";
const SMART_CATEGORIES_KEY: &str = "smart_categories";

/// Persisted smart-category document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SmartCategoryDoc {
    #[serde(default)]
    categories: Vec<SmartCategory>,
    #[serde(default)]
    generated_at: Option<DateTime<Utc>>,
}

/// Durable bookmark metadata plus the current smart categories.
pub struct MetadataStore<B: StorageBackend> {
    backend: B,
    meta: HashMap<String, BookmarkMeta>,
    smart: SmartCategoryDoc,
}

impl<B: StorageBackend> MetadataStore<B> {
    /// Load both documents from the backend.
    ///
    /// A document that no longer parses is copied to `<key>.corrupt` and the
    /// store starts from defaults for it.
    pub fn open(backend: B) -> Result<Self> {
        let meta: HashMap<String, BookmarkMeta> = load_document(&backend, BOOKMARK_META_KEY)?;
        let smart: SmartCategoryDoc = load_document(&backend, SMART_CATEGORIES_KEY)?;
        tracing::debug!(bookmarks = meta.len(), "opened metadata store");
        Ok(Self {
            backend,
            meta,
            smart,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stored metadata for one bookmark.
    pub fn get(&self, id: &str) -> Option<&BookmarkMeta> {
        self.meta.get(id)
    }

    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    /// Merge a partial update into one bookmark's record.
    ///
    /// Fields present in `update` overwrite; absent fields keep their stored
    /// value. A bookmark without a record starts from empty defaults.
    pub fn merge_bookmark_fields(&mut self, id: &str, update: &MetaUpdate) -> Result<()> {
        self.merge_many(std::iter::once((id, update)))
    }

    /// Merge several updates with a single flush.
    pub fn merge_many<'a, I>(&mut self, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a MetaUpdate)>,
    {
        let mut next = self.meta.clone();
        let mut touched = 0usize;
        for (id, update) in updates {
            if update.is_empty() {
                continue;
            }
            update.apply_to(next.entry(id.to_string()).or_default());
            touched += 1;
        }
        if touched == 0 {
            return Ok(());
        }

        self.flush(BOOKMARK_META_KEY, &next)?;
        self.meta = next;
        tracing::debug!(touched, "merged bookmark metadata");
        Ok(())
    }

    /// Drop metadata for bookmarks the host tree no longer has.
    pub fn retain_bookmarks(&mut self, live_ids: &HashSet<String>) -> Result<usize> {
        let next: HashMap<String, BookmarkMeta> = self
            .meta
            .iter()
            .filter(|(id, _)| live_ids.contains(*id))
            .map(|(id, meta)| (id.clone(), meta.clone()))
            .collect();
        let removed = self.meta.len() - next.len();
        if removed == 0 {
            return Ok(0);
        }

        self.flush(BOOKMARK_META_KEY, &next)?;
        self.meta = next;
        tracing::info!(removed, "pruned metadata of deleted bookmarks");
        Ok(removed)
    }

    /// Current smart categories (empty before the first run).
    pub fn smart_categories(&self) -> &[SmartCategory] {
        &self.smart.categories
    }

    pub fn smart_categories_generated_at(&self) -> Option<DateTime<Utc>> {
        self.smart.generated_at
    }

    /// Overwrite the smart-category list. Never merged with the previous run.
    pub fn replace_smart_categories(&mut self, categories: Vec<SmartCategory>) -> Result<()> {
        let next = SmartCategoryDoc {
            categories,
            generated_at: Some(Utc::now()),
        };
        self.flush(SMART_CATEGORIES_KEY, &next)?;
        tracing::info!(
            categories = next.categories.len(),
            "replaced smart categories"
        );
        self.smart = next;
        Ok(())
    }

    /// Overlay stored metadata onto the host's bookmark records.
    ///
    /// Non-empty stored values win. An empty stored field counts as unset, so
    /// tags or a summary cleared through the store fall back to the host's own
    /// values; clearing only sticks when the host record is empty too.
    pub fn candidates(&self, sources: &[SourceBookmark]) -> Vec<Bookmark> {
        sources
            .iter()
            .map(|source| {
                let stored = self.meta.get(&source.id);
                let tags = match stored {
                    Some(meta) if !meta.tags.is_empty() => meta.tags.clone(),
                    _ => source.tags.clone().unwrap_or_default(),
                };
                let summary = match stored {
                    Some(meta) if !meta.summary.is_empty() => meta.summary.clone(),
                    _ => source.summary.clone().unwrap_or_default(),
                };
                Bookmark {
                    id: source.id.clone(),
                    title: source.title.clone(),
                    url: source.url.clone(),
                    tags,
                    summary,
                    manual_category: stored.and_then(|meta| meta.manual_category.clone()),
                }
            })
            .collect()
    }

    fn flush<T: Serialize>(&self, key: &str, doc: &T) -> Result<()> {
        let content = serde_json::to_string(doc)
            .with_context(|| format!("Failed to serialize '{}'", key))?;
        self.backend
            .write(key, &content)
            .with_context(|| format!("Failed to persist '{}'", key))?;
        Ok(())
    }
}

fn load_document<B, T>(backend: &B, key: &str) -> Result<T>
where
    B: StorageBackend,
    T: DeserializeOwned + Default,
{
    let Some(content) = backend
        .read(key)
        .with_context(|| format!("Failed to read '{}'", key))?
    else {
        return Ok(T::default());
    };

    match serde_json::from_str(&content) {
        Ok(doc) => Ok(doc),
        Err(err) => {
            tracing::warn!(
                key,
                error = %err,
                "stored document is corrupt; a backup was kept and defaults were loaded"
            );
            backend
                .write(&format!("{}.corrupt", key), &content)
                .with_context(|| format!("Failed to back up corrupt '{}'", key))?;
            Ok(T::default())
        }
    }
}
