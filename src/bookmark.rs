//! Bookmark and smart-category records
//!
//! Bookmark identity belongs to the host bookmark tree. This crate only
//! ever changes tags, summary and the manual category of a bookmark.

use serde::{Deserialize, Deserializer, Serialize};

/// Fixed id of the "uncategorized" smart category, stable across runs.
pub const UNCATEGORIZED_ID: &str = "smart_uncategorized";
/// Display name of the uncategorized bucket.
pub const UNCATEGORIZED_NAME: &str = "uncategorized";

/// Maximum number of tags kept per bookmark.
pub const MAX_TAGS: usize = 5;
/// Summary length limit when the text contains CJK characters.
pub const MAX_SUMMARY_CJK_CHARS: usize = 25;
/// Summary length limit for Latin text.
pub const MAX_SUMMARY_LATIN_CHARS: usize = 50;

/// A bookmark as supplied by the host bookmark tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBookmark {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// A bookmark with its AI/user metadata overlaid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub manual_category: Option<String>,
}

impl Bookmark {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Bookmarks with neither tags nor summary carry too little signal to
    /// classify and go straight to the uncategorized bucket.
    pub fn has_descriptors(&self) -> bool {
        let has_tags = self.tags.iter().any(|t| !t.trim().is_empty());
        has_tags || !self.summary.trim().is_empty()
    }
}

/// Stored per-bookmark metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub manual_category: Option<String>,
}

/// Partial update for [`BookmarkMeta`]. Absent fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// `Some(None)` clears the manual category; `None` keeps it.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_field"
    )]
    pub manual_category: Option<Option<String>>,
}

fn present_field<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl MetaUpdate {
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: Some(tags.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Default::default()
        }
    }

    pub fn manual_category(category: Option<String>) -> Self {
        Self {
            manual_category: Some(category),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.summary.is_none() && self.manual_category.is_none()
    }

    /// Apply onto an existing record, touching only the fields present here.
    pub fn apply_to(&self, meta: &mut BookmarkMeta) {
        if let Some(tags) = &self.tags {
            meta.tags = tags.clone();
        }
        if let Some(summary) = &self.summary {
            meta.summary = summary.clone();
        }
        if let Some(category) = &self.manual_category {
            meta.manual_category = category.clone();
        }
    }
}

/// An AI-derived thematic grouping. Recomputed in full on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartCategory {
    pub id: String,
    pub name: String,
    pub bookmark_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl SmartCategory {
    pub fn is_uncategorized(&self) -> bool {
        self.id == UNCATEGORIZED_ID
    }
}

/// True when the text contains CJK ideographs, kana or hangul.
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c as u32,
            0x3040..=0x30FF      // kana
            | 0x3400..=0x4DBF    // CJK extension A
            | 0x4E00..=0x9FFF    // CJK unified
            | 0xAC00..=0xD7AF    // hangul
            | 0xF900..=0xFAFF    // compatibility ideographs
            | 0xFF00..=0xFFEF)   // full-width forms
    })
}

/// Summary length limit for the given text.
pub fn summary_limit(text: &str) -> usize {
    if contains_cjk(text) {
        MAX_SUMMARY_CJK_CHARS
    } else {
        MAX_SUMMARY_LATIN_CHARS
    }
}
