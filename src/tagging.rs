//! AI tags and summaries for individual bookmarks
//!
//! The model answers in a two-line format (`Tags: ...` / `Summary: ...`,
//! Chinese labels accepted). Only fields that came back non-empty are merged,
//! so a poor answer never wipes what the user already has.
//!
//! With a [`PageFetcher`], each bookmark's page is read first and its title,
//! description and text go into the prompt. A page that cannot be read is
//! mentioned in the prompt and tagging goes ahead.

use crate::bookmark::{summary_limit, Bookmark, MetaUpdate, MAX_TAGS};
use crate::crawler::{PageFetcher, PageLookup};
use crate::error::{Error, Result};
use crate::llm::prompts::tagging_request;
use crate::llm::CompletionClient;
use crate::smart::{paced_with_retry, BackoffPolicy, CancelToken};
use crate::store::backend::StorageBackend;
use crate::store::MetadataStore;
use crate::util::truncate_chars;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Outcome of a batch tagging pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggingReport {
    /// Ids whose metadata was updated.
    pub tagged: Vec<String>,
    /// Ids that failed, with a readable reason.
    pub failed: Vec<(String, String)>,
    /// The pass stopped early because it was cancelled.
    pub cancelled: bool,
}

/// Ask the model for tags and a summary of one bookmark.
pub async fn generate_tags_and_summary<C>(client: &C, bookmark: &Bookmark) -> Result<MetaUpdate>
where
    C: CompletionClient + ?Sized,
{
    generate_with_page(client, bookmark, None).await
}

/// Like [`generate_tags_and_summary`], with the outcome of reading the page.
pub async fn generate_with_page<C>(
    client: &C,
    bookmark: &Bookmark,
    page: Option<&PageLookup>,
) -> Result<MetaUpdate>
where
    C: CompletionClient + ?Sized,
{
    let reply = client.complete(&tagging_request(bookmark, page)).await?;
    let update = parse_tag_reply(&reply);
    if update.is_empty() {
        return Err(Error::Parse(
            "the reply contained neither tags nor a summary".to_string(),
        ));
    }
    Ok(update)
}

/// Tag bookmarks one after another, merging each result as it arrives.
///
/// Failures are recorded per bookmark. Cancellation stops further requests;
/// results merged before that point are kept.
pub async fn tag_bookmarks<B, C>(
    store: &mut MetadataStore<B>,
    client: &C,
    bookmarks: &[Bookmark],
    policy: &BackoffPolicy,
    cancel: &CancelToken,
) -> Result<TaggingReport>
where
    B: StorageBackend,
    C: CompletionClient + ?Sized,
{
    tag_bookmarks_with_pages(store, client, None, bookmarks, policy, cancel).await
}

/// [`tag_bookmarks`], reading each page through `fetcher` when one is given.
///
/// A page is fetched once per bookmark; retries after rate limiting reuse it.
pub async fn tag_bookmarks_with_pages<B, C>(
    store: &mut MetadataStore<B>,
    client: &C,
    fetcher: Option<&PageFetcher>,
    bookmarks: &[Bookmark],
    policy: &BackoffPolicy,
    cancel: &CancelToken,
) -> Result<TaggingReport>
where
    B: StorageBackend,
    C: CompletionClient + ?Sized,
{
    if bookmarks.is_empty() {
        return Err(Error::EmptyInput);
    }

    let mut report = TaggingReport::default();
    for (index, bookmark) in bookmarks.iter().enumerate() {
        let delay = if index == 0 {
            policy.initial_delay
        } else {
            policy.inter_batch_delay
        };

        let page = match fetcher {
            Some(fetcher) if !cancel.is_cancelled() => Some(fetcher.lookup(&bookmark.url).await),
            _ => None,
        };
        let outcome = paced_with_retry(policy, cancel, delay, || {
            generate_with_page(client, bookmark, page.as_ref())
        })
        .await;

        match outcome {
            Ok(update) => {
                store.merge_bookmark_fields(&bookmark.id, &update)?;
                report.tagged.push(bookmark.id.clone());
            }
            Err(Error::Cancelled) => {
                tracing::info!(tagged = report.tagged.len(), "tagging cancelled");
                report.cancelled = true;
                break;
            }
            Err(err) if err.is_batch_local() => {
                tracing::warn!(bookmark = %bookmark.id, error = %err, "tagging failed");
                report.failed.push((bookmark.id.clone(), err.to_string()));
            }
            Err(err) => return Err(err),
        }
    }

    tracing::info!(
        tagged = report.tagged.len(),
        failed = report.failed.len(),
        "tagging finished"
    );
    Ok(report)
}

/// Parse a `Tags:` / `Summary:` reply into a partial update.
pub fn parse_tag_reply(reply: &str) -> MetaUpdate {
    let mut update = MetaUpdate::default();

    if let Some(line) = labelled_value(tags_line_re(), reply) {
        let tags = split_tags(&line);
        if !tags.is_empty() {
            update.tags = Some(tags);
        }
    }

    if let Some(line) = labelled_value(summary_line_re(), reply) {
        let summary = clean_summary(&line);
        if !summary.is_empty() {
            update.summary = Some(summary);
        }
    }

    update
}

fn labelled_value(re: Option<&'static Regex>, reply: &str) -> Option<String> {
    re?.captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn split_tags(line: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    line.split([',', '，', '、'])
        .map(|t| {
            t.trim()
                .trim_start_matches(['#', '-', '*', '•'])
                .trim()
                .to_string()
        })
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .take(MAX_TAGS)
        .collect()
}

fn clean_summary(line: &str) -> String {
    let text = line
        .trim()
        .trim_start_matches(['-', '*', '•'])
        .trim()
        .trim_matches(['"', '“', '”'])
        .trim();
    truncate_chars(text, summary_limit(text)).to_string()
}

fn tags_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^[\s\-*#>]*(?:tags?|标签)[^:：\n]*[:：][ \t]*(.*)$").ok())
        .as_ref()
}

fn summary_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^[\s\-*#>]*(?:summary|description|描述|摘要)[^:：\n]*[:：][ \t]*(.*)$").ok()
    })
    .as_ref()
}
