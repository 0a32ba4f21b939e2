//! Batch planning
//!
//! Shrinks bookmark records so a batch stays well inside the model's context
//! window, then cuts the list into contiguous chunks in input order.

use crate::bookmark::Bookmark;
use crate::util::truncate_chars;
use serde::Serialize;

pub const DEFAULT_BATCH_SIZE: usize = 15;
pub const MAX_TITLE_CHARS: usize = 50;
pub const MAX_URL_CHARS: usize = 100;
pub const MAX_SUMMARY_CHARS: usize = 100;
pub const MAX_TAGS_PER_ENTRY: usize = 3;

/// A shrunk, request-only copy of a bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    pub tags: Vec<String>,
    pub summary: String,
}

impl BatchEntry {
    pub fn shrink(bookmark: &Bookmark) -> Self {
        Self {
            id: bookmark.id.clone(),
            title: truncate_chars(bookmark.title.trim(), MAX_TITLE_CHARS).to_string(),
            url: truncate_chars(bookmark.url.trim(), MAX_URL_CHARS).to_string(),
            tags: bookmark
                .tags
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .take(MAX_TAGS_PER_ENTRY)
                .map(str::to_string)
                .collect(),
            summary: truncate_chars(bookmark.summary.trim(), MAX_SUMMARY_CHARS).to_string(),
        }
    }
}

/// Split bookmarks into batches of at most `max_per_batch` shrunk entries.
///
/// A size of zero is treated as one. Empty input gives an empty plan.
pub fn plan(bookmarks: &[Bookmark], max_per_batch: usize) -> Vec<Vec<BatchEntry>> {
    let size = max_per_batch.max(1);
    bookmarks
        .chunks(size)
        .map(|chunk| chunk.iter().map(BatchEntry::shrink).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmarks(n: usize) -> Vec<Bookmark> {
        (0..n)
            .map(|i| Bookmark::new(i.to_string(), format!("Page {}", i), "https://example.com"))
            .collect()
    }

    #[test]
    fn test_plan_chunks_in_order() {
        let plan = plan(&bookmarks(35), 15);
        let sizes: Vec<usize> = plan.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![15, 15, 5]);

        let ids: Vec<&str> = plan.iter().flatten().map(|e| e.id.as_str()).collect();
        let expected: Vec<String> = (0..35).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let input = bookmarks(20);
        assert_eq!(plan(&input, 7), plan(&input, 7));
    }

    #[test]
    fn test_plan_empty_and_zero_size() {
        assert!(plan(&[], 15).is_empty());
        assert_eq!(plan(&bookmarks(3), 0).len(), 3);
    }

    #[test]
    fn test_shrink_limits_fields_without_touching_source() {
        let long = Bookmark::new("x", "标".repeat(80), format!("https://e.com/{}", "a".repeat(200)))
            .with_tags(["a", " ", "b", "c", "d"])
            .with_summary("s".repeat(300));
        let entry = BatchEntry::shrink(&long);

        assert_eq!(entry.title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(entry.url.chars().count(), MAX_URL_CHARS);
        assert_eq!(entry.tags, vec!["a", "b", "c"]);
        assert_eq!(entry.summary.chars().count(), MAX_SUMMARY_CHARS);
        assert_eq!(long.summary.len(), 300);
    }
}
