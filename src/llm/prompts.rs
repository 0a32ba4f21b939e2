//! Prompt text for classification and tagging requests.

use super::client::CompletionRequest;
use crate::bookmark::Bookmark;
use crate::crawler::{prompt_excerpt, PageLookup};
use crate::smart::planner::BatchEntry;
use serde_json::{json, Value};

/// Soft ceiling on categories per batch; the model is asked, not forced.
pub const SUGGESTED_MAX_CATEGORIES: usize = 10;

pub const CATEGORIZE_SYSTEM: &str = r#"You organize browser bookmarks into thematic categories.
Reply with ONLY a JSON array. No prose, no Markdown, no code fences.
Each element must be an object of the form:
{"name": "<short category name>", "bookmarkIds": ["<id>", ...], "description": "<one sentence>"}
Use only bookmark ids that appear in the input. A bookmark may be left out if nothing fits."#;

pub const TAGGING_SYSTEM: &str = r#"You are an archivist who helps people find web pages again.
You extract precise keywords and write a short functional description of a page.
Reply strictly in the requested format without extra prefixes, symbols or markup."#;

/// Build the classification request for one batch.
pub fn categorize_request(batch: &[BatchEntry]) -> CompletionRequest {
    let records = Value::Array(
        batch
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.id,
                    "title": entry.title,
                    "url": entry.url,
                    "tags": entry.tags,
                    "summary": entry.summary,
                })
            })
            .collect(),
    );

    let user = format!(
        "Group these bookmarks into at most {max} categories by topic.\n\n\
         Bookmarks:\n{records}\n\n\
         Return a JSON array like:\n\
         [{{\"name\": \"Development\", \"bookmarkIds\": [\"1\", \"2\"], \"description\": \"Programming tools and docs\"}}]",
        max = SUGGESTED_MAX_CATEGORIES,
        records = records,
    );

    CompletionRequest::new(CATEGORIZE_SYSTEM, user)
}

/// Build the tag/summary request for one bookmark, with whatever was read
/// from its page.
pub fn tagging_request(bookmark: &Bookmark, page: Option<&PageLookup>) -> CompletionRequest {
    let fetched = page.and_then(PageLookup::content);
    let title = fetched
        .map(|p| p.title.trim())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| bookmark.title.trim());

    let mut parts = vec![
        if page.is_some() {
            "Analyze this web page and its content:".to_string()
        } else {
            "Analyze this web page:".to_string()
        },
        format!("Title: {}", title),
        format!("URL: {}", bookmark.url.trim()),
    ];
    if !bookmark.summary.trim().is_empty() {
        parts.push(format!("Current description: {}", bookmark.summary.trim()));
    }
    if let Some(fetched) = fetched {
        if !fetched.description.trim().is_empty() {
            parts.push(format!("Page description: {}", fetched.description.trim()));
        }
        let excerpt = prompt_excerpt(fetched);
        if !excerpt.is_empty() {
            parts.push(format!("Content: {}", excerpt));
        }
    }
    if let Some(PageLookup::Failed(reason)) = page {
        parts.push(format!(
            "Note: the page content could not be fetched ({}). Base the tags and description on the information available.",
            reason
        ));
    }

    let user = format!(
        "{}\n\n\
         Produce 3 to 5 short tags (keywords) and one concise description of what the page is for.\n\
         Tags: at most 5, separated by commas, plain words only, no hyphens or bullets.\n\
         Description: at most 25 characters for Chinese text or 50 characters for English text, no prefix.\n\n\
         Reply in exactly this format:\n\
         Tags: tag1, tag2, tag3\n\
         Summary: the description",
        parts.join("\n")
    );

    CompletionRequest::new(TAGGING_SYSTEM, user)
}
