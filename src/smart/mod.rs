//! Smart categorization
//!
//! A run overlays stored metadata onto the host's bookmarks, plans batches,
//! sends them one at a time, recovers categories from each reply and
//! reconciles everything into a list that covers every bookmark at least
//! once, ending with the fixed "uncategorized" bucket.
//!
//! Batches run strictly in sequence. A failed batch only costs its own
//! bookmarks (they land in "uncategorized"); later batches still run.

pub mod planner;
pub mod reconcile;
pub mod recover;

use crate::bookmark::{Bookmark, SmartCategory, SourceBookmark};
use crate::error::{Error, Result};
use crate::llm::{classify, CompletionClient};
use crate::store::backend::StorageBackend;
use crate::store::MetadataStore;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use planner::{plan, BatchEntry, DEFAULT_BATCH_SIZE};
pub use reconcile::reconcile;
pub use recover::{recover, RecoveredCategory, FALLBACK_CATEGORY_NAME};

// ═══════════════════════════════════════════════════════════════════════════
// Pacing and cancellation
// ═══════════════════════════════════════════════════════════════════════════

/// Delays between requests and the retry budget for throttled batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Warm-up pause before the first request.
    pub initial_delay: Duration,
    /// Pause before every request after the first.
    pub inter_batch_delay: Duration,
    /// Pause after a rate-limited response before retrying.
    pub rate_limit_delay: Duration,
    /// Retries allowed per batch after rate limiting.
    pub max_retries_per_batch: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            inter_batch_delay: Duration::from_secs(6),
            rate_limit_delay: Duration::from_secs(15),
            max_retries_per_batch: 1,
        }
    }
}

impl BackoffPolicy {
    /// No delays at all, same retry budget. For tests and local endpoints.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    fn delay_before(&self, index: usize) -> Duration {
        if index == 0 {
            self.initial_delay
        } else {
            self.inter_batch_delay
        }
    }
}

/// Cooperative stop signal, checked before every request and after every delay.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Pause for `delay`, then run `attempt`, retrying after rate limiting
/// while the policy allows it.
pub(crate) async fn paced_with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancelToken,
    delay: Duration,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    cancel.check()?;
    pause(delay).await;
    cancel.check()?;

    let mut retries = 0;
    loop {
        match attempt().await {
            Err(err) if err.is_rate_limited() && retries < policy.max_retries_per_batch => {
                retries += 1;
                tracing::warn!(
                    retry = retries,
                    max_retries = policy.max_retries_per_batch,
                    delay_ms = policy.rate_limit_delay.as_millis() as u64,
                    "rate limited; backing off before retrying"
                );
                pause(policy.rate_limit_delay).await;
                cancel.check()?;
            }
            other => return other,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Run report
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of one categorization run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub categories: Vec<SmartCategory>,
    pub batches_total: usize,
    pub batches_failed: usize,
    /// Bookmarks placed in "uncategorized" without being sent to the model.
    pub bucketed_without_ai: usize,
    pub failure_messages: Vec<String>,
}

impl RunReport {
    pub fn all_batches_failed(&self) -> bool {
        self.batches_total > 0 && self.batches_failed == self.batches_total
    }

    /// One readable line describing what went wrong, if anything did.
    pub fn failure_summary(&self) -> Option<String> {
        if self.batches_failed == 0 {
            return None;
        }
        let first = self
            .failure_messages
            .first()
            .map(String::as_str)
            .unwrap_or("unknown error");
        if self.all_batches_failed() {
            Some(format!(
                "AI classification failed for every batch, so all bookmarks were left uncategorized: {}",
                first
            ))
        } else {
            Some(format!(
                "{} of {} batches failed and their bookmarks were left uncategorized: {}",
                self.batches_failed, self.batches_total, first
            ))
        }
    }

    pub fn uncategorized(&self) -> Option<&SmartCategory> {
        self.categories.iter().find(|c| c.is_uncategorized())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Categorizer
// ═══════════════════════════════════════════════════════════════════════════

/// Runs batched AI classification over a bookmark set.
pub struct SmartCategorizer<C> {
    client: C,
    policy: BackoffPolicy,
    batch_size: usize,
    bucket_untagged: bool,
}

impl<C: CompletionClient> SmartCategorizer<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            policy: BackoffPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            bucket_untagged: true,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// When set, bookmarks with neither tags nor summary skip the model and
    /// go straight to "uncategorized".
    pub fn with_bucket_untagged(mut self, bucket_untagged: bool) -> Self {
        self.bucket_untagged = bucket_untagged;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Classify `bookmarks`. Nothing is persisted here.
    ///
    /// Batch failures are recorded in the report, not returned. Errors are
    /// returned only for cancellation and failures that are not local to a
    /// batch.
    pub async fn run(&self, bookmarks: &[Bookmark], cancel: &CancelToken) -> Result<RunReport> {
        let all_ids: Vec<String> = bookmarks.iter().map(|b| b.id.clone()).collect();

        if bookmarks.is_empty() {
            return Ok(RunReport {
                categories: reconcile(&all_ids, Vec::new(), &HashSet::new(), Utc::now()),
                ..RunReport::default()
            });
        }
        cancel.check()?;

        let bucketable: HashSet<String> = if self.bucket_untagged {
            bookmarks
                .iter()
                .filter(|b| !b.has_descriptors())
                .map(|b| b.id.clone())
                .collect()
        } else {
            HashSet::new()
        };
        let submit: Vec<Bookmark> = bookmarks
            .iter()
            .filter(|b| !bucketable.contains(&b.id))
            .cloned()
            .collect();

        let batches = plan(&submit, self.batch_size);
        tracing::info!(
            bookmarks = bookmarks.len(),
            batches = batches.len(),
            bucketed = bucketable.len(),
            "starting smart categorization"
        );

        let mut per_batch: Vec<Vec<RecoveredCategory>> = Vec::with_capacity(batches.len());
        let mut failure_messages = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            let outcome = paced_with_retry(
                &self.policy,
                cancel,
                self.policy.delay_before(index),
                || classify(&self.client, batch),
            )
            .await;

            match outcome {
                Ok(raw) => {
                    let candidates: HashSet<String> =
                        batch.iter().map(|e| e.id.clone()).collect();
                    let recovered = recover(&raw, &candidates);
                    tracing::debug!(
                        batch = index,
                        categories = recovered.len(),
                        "batch classified"
                    );
                    per_batch.push(recovered);
                }
                Err(err) if err.is_batch_local() => {
                    tracing::warn!(
                        batch = index,
                        bookmarks = batch.len(),
                        error = %err,
                        "batch failed; its bookmarks stay uncategorized"
                    );
                    failure_messages.push(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        let report = RunReport {
            categories: reconcile(&all_ids, per_batch, &bucketable, Utc::now()),
            batches_total: batches.len(),
            batches_failed: failure_messages.len(),
            bucketed_without_ai: bucketable.len(),
            failure_messages,
        };
        if let Some(summary) = report.failure_summary() {
            tracing::warn!("{}", summary);
        }
        tracing::info!(
            categories = report.categories.len(),
            failed = report.batches_failed,
            "smart categorization finished"
        );
        Ok(report)
    }
}

/// Recompute smart categories for `sources` and commit them to the store.
///
/// The store is only written when the run completes; a cancelled or failed
/// run leaves the previous categories in place.
pub async fn regenerate<B, C>(
    store: &mut MetadataStore<B>,
    categorizer: &SmartCategorizer<C>,
    sources: &[SourceBookmark],
    cancel: &CancelToken,
) -> Result<RunReport>
where
    B: StorageBackend,
    C: CompletionClient,
{
    let candidates = store.candidates(sources);
    let report = categorizer.run(&candidates, cancel).await?;
    store.replace_smart_categories(report.categories.clone())?;
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedClient};
    use super::*;
    use crate::bookmark::UNCATEGORIZED_ID;
    use crate::store::MemoryBackend;

    fn tagged(id: &str) -> Bookmark {
        Bookmark::new(id, format!("Page {}", id), format!("https://example.com/{}", id))
            .with_tags(["web"])
    }

    fn tagged_set(n: usize) -> Vec<Bookmark> {
        (1..=n).map(|i| tagged(&i.to_string())).collect()
    }

    fn categorizer(client: ScriptedClient, batch_size: usize) -> SmartCategorizer<ScriptedClient> {
        SmartCategorizer::new(client)
            .with_policy(BackoffPolicy::immediate())
            .with_batch_size(batch_size)
    }

    fn covered(report: &RunReport) -> HashSet<String> {
        report
            .categories
            .iter()
            .flat_map(|c| c.bookmark_ids.iter().cloned())
            .collect()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_input_makes_no_request() {
        let smart = categorizer(ScriptedClient::default(), 15);
        let report = smart.run(&[], &CancelToken::new()).await.unwrap();

        assert_eq!(smart.client().calls(), 0);
        assert_eq!(report.categories.len(), 1);
        assert_eq!(report.categories[0].id, UNCATEGORIZED_ID);
        assert!(report.categories[0].bookmark_ids.is_empty());
        assert_eq!(report.failure_summary(), None);
    }

    #[tokio::test]
    async fn every_bookmark_is_covered_and_foreign_ids_dropped() {
        let client = ScriptedClient::new(vec![
            Reply::text(r#"[{"name":"Dev","bookmarkIds":["1","3","99"]}]"#),
            Reply::text(r#"[{"name":"News","bookmarkIds":["4","1"]}]"#),
        ]);
        let smart = categorizer(client, 2);
        let bookmarks = tagged_set(4);
        let report = smart.run(&bookmarks, &CancelToken::new()).await.unwrap();

        let expected: HashSet<String> = (1..=4).map(|i| i.to_string()).collect();
        assert_eq!(covered(&report), expected);

        // batch 1 held 1 and 2, so "3" is foreign there; batch 2 held 3 and 4
        assert_eq!(report.categories[0].bookmark_ids, ids(&["1"]));
        assert_eq!(report.categories[1].bookmark_ids, ids(&["4"]));
        assert_eq!(report.uncategorized().unwrap().bookmark_ids, ids(&["2", "3"]));
        assert_eq!(report.batches_total, 2);
    }

    #[tokio::test]
    async fn failed_batch_is_isolated() {
        let client = ScriptedClient::new(vec![
            Reply::text(r#"[{"name":"A","bookmarkIds":["1","2"]}]"#),
            Reply::ServerError,
            Reply::text(r#"[{"name":"C","bookmarkIds":["5","6"]}]"#),
        ]);
        let smart = categorizer(client, 2);
        let report = smart
            .run(&tagged_set(6), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(smart.client().calls(), 3);
        assert_eq!(report.batches_failed, 1);
        assert!(!report.all_batches_failed());
        assert_eq!(report.uncategorized().unwrap().bookmark_ids, ids(&["3", "4"]));
        let names: Vec<&str> = report.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C", "uncategorized"]);
        assert!(report.failure_summary().unwrap().contains("1 of 3 batches"));
    }

    #[tokio::test]
    async fn rate_limited_batch_is_retried_once() {
        let client = ScriptedClient::new(vec![
            Reply::RateLimited,
            Reply::text(r#"[{"name":"A","bookmarkIds":["1"]}]"#),
        ]);
        let smart = categorizer(client, 15);
        let report = smart.run(&tagged_set(1), &CancelToken::new()).await.unwrap();

        assert_eq!(smart.client().calls(), 2);
        assert_eq!(report.batches_failed, 0);
        assert_eq!(report.categories[0].bookmark_ids, ids(&["1"]));
    }

    #[tokio::test]
    async fn rate_limit_retry_budget_is_bounded() {
        let client = ScriptedClient::new(vec![
            Reply::RateLimited,
            Reply::RateLimited,
            Reply::text(r#"[{"name":"B","bookmarkIds":["2"]}]"#),
        ]);
        let smart = categorizer(client, 1);
        let report = smart.run(&tagged_set(2), &CancelToken::new()).await.unwrap();

        // two attempts on batch 1, then batch 2 proceeds
        assert_eq!(smart.client().calls(), 3);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.uncategorized().unwrap().bookmark_ids, ids(&["1"]));
        assert!(report.failure_messages[0].contains("rate limiting"));
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let client = ScriptedClient::new(vec![Reply::Timeout]);
        let smart = categorizer(client, 15);
        let report = smart.run(&tagged_set(2), &CancelToken::new()).await.unwrap();

        assert_eq!(smart.client().calls(), 1);
        assert!(report.all_batches_failed());
        assert_eq!(report.uncategorized().unwrap().bookmark_ids, ids(&["1", "2"]));
        assert!(report
            .failure_summary()
            .unwrap()
            .starts_with("AI classification failed for every batch"));
    }

    #[tokio::test]
    async fn unusable_reply_groups_batch_under_fallback() {
        let client = ScriptedClient::new(vec![Reply::text("no idea, sorry")]);
        let smart = categorizer(client, 15);
        let report = smart.run(&tagged_set(2), &CancelToken::new()).await.unwrap();

        assert_eq!(report.categories[0].name, FALLBACK_CATEGORY_NAME);
        assert_eq!(report.categories[0].bookmark_ids, ids(&["1", "2"]));
        assert!(report.uncategorized().unwrap().bookmark_ids.is_empty());
    }

    #[tokio::test]
    async fn bookmarks_without_descriptors_skip_the_model() {
        let client = ScriptedClient::new(vec![Reply::text(
            r#"[{"name":"A","bookmarkIds":["1","bare"]}]"#,
        )]);
        let smart = categorizer(client, 15);
        let bookmarks = vec![tagged("1"), Bookmark::new("bare", "Bare", "https://bare.example")];
        let report = smart.run(&bookmarks, &CancelToken::new()).await.unwrap();

        assert_eq!(report.bucketed_without_ai, 1);
        let sent = smart.client().requests.lock().unwrap()[0]
            .user_content()
            .unwrap()
            .to_string();
        assert!(!sent.contains("\"bare\""));
        assert_eq!(report.categories[0].bookmark_ids, ids(&["1"]));
        assert_eq!(report.uncategorized().unwrap().bookmark_ids, ids(&["bare"]));
    }

    #[tokio::test]
    async fn only_bare_bookmarks_needs_no_request() {
        let smart = categorizer(ScriptedClient::default(), 15);
        let bookmarks = vec![Bookmark::new("a", "A", "https://a.example")];
        let report = smart.run(&bookmarks, &CancelToken::new()).await.unwrap();

        assert_eq!(smart.client().calls(), 0);
        assert_eq!(report.batches_total, 0);
        assert_eq!(report.uncategorized().unwrap().bookmark_ids, ids(&["a"]));
    }

    #[tokio::test]
    async fn bucketing_can_be_disabled() {
        let client = ScriptedClient::new(vec![Reply::text(
            r#"[{"name":"A","bookmarkIds":["bare"]}]"#,
        )]);
        let smart = categorizer(client, 15).with_bucket_untagged(false);
        let bookmarks = vec![Bookmark::new("bare", "Bare", "https://bare.example")];
        let report = smart.run(&bookmarks, &CancelToken::new()).await.unwrap();

        assert_eq!(smart.client().calls(), 1);
        assert_eq!(report.categories[0].bookmark_ids, ids(&["bare"]));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let smart = categorizer(ScriptedClient::default(), 15);
        let err = smart.run(&tagged_set(3), &cancel).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(smart.client().calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_between_batches() {
        let cancel = CancelToken::new();
        let client = ScriptedClient::new(vec![Reply::text(
            r#"[{"name":"A","bookmarkIds":["1"]}]"#,
        )])
        .cancelling_on(1, cancel.clone());
        let smart = categorizer(client, 1);
        let err = smart.run(&tagged_set(3), &cancel).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(smart.client().calls(), 1);
    }

    #[tokio::test]
    async fn regenerate_commits_completed_run() {
        let mut store = MetadataStore::open(MemoryBackend::new()).unwrap();
        let client = ScriptedClient::new(vec![Reply::text(
            r#"[{"name":"Docs","bookmarkIds":["1"]}]"#,
        )]);
        let smart = categorizer(client, 15);
        let sources = vec![SourceBookmark {
            id: "1".to_string(),
            title: "Docs".to_string(),
            url: "https://docs.rs".to_string(),
            tags: Some(vec!["rust".to_string()]),
            summary: None,
        }];

        let report = regenerate(&mut store, &smart, &sources, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(store.smart_categories(), report.categories.as_slice());
        assert_eq!(store.smart_categories()[0].name, "Docs");
        assert!(store.smart_categories_generated_at().is_some());
    }

    #[tokio::test]
    async fn cancelled_regenerate_keeps_previous_categories() {
        let mut store = MetadataStore::open(MemoryBackend::new()).unwrap();
        let previous = vec![SmartCategory {
            id: UNCATEGORIZED_ID.to_string(),
            name: "uncategorized".to_string(),
            bookmark_ids: ids(&["1"]),
            description: None,
            icon: None,
        }];
        store.replace_smart_categories(previous.clone()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let smart = categorizer(ScriptedClient::default(), 15);
        let sources = vec![SourceBookmark {
            id: "1".to_string(),
            title: "Docs".to_string(),
            url: "https://docs.rs".to_string(),
            tags: None,
            summary: Some("Rust crate docs".to_string()),
        }];

        let err = regenerate(&mut store, &smart, &sources, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.smart_categories(), previous.as_slice());
    }

    fn paced() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            inter_batch_delay: Duration::from_secs(6),
            rate_limit_delay: Duration::from_secs(15),
            max_retries_per_batch: 1,
        }
    }

    fn offsets(client: &ScriptedClient, start: tokio::time::Instant) -> Vec<Duration> {
        client
            .sent_at
            .lock()
            .unwrap()
            .iter()
            .map(|at| at.duration_since(start))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn batches_wait_for_warm_up_and_inter_batch_delays() {
        let smart = SmartCategorizer::new(ScriptedClient::default())
            .with_policy(paced())
            .with_batch_size(2);
        let start = tokio::time::Instant::now();

        smart
            .run(&tagged_set(6), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(
            offsets(smart.client(), start),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(7),
                Duration::from_secs(13),
            ]
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 * 6));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_adds_one_extended_delay() {
        let client = ScriptedClient::new(vec![
            Reply::text("[]"),
            Reply::RateLimited,
            Reply::text("[]"),
            Reply::text("[]"),
        ]);
        let smart = SmartCategorizer::new(client)
            .with_policy(paced())
            .with_batch_size(2);
        let start = tokio::time::Instant::now();

        let report = smart
            .run(&tagged_set(6), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.batches_failed, 0);
        assert_eq!(
            offsets(smart.client(), start),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(7),
                Duration::from_secs(22),
                Duration::from_secs(28),
            ]
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 * 6 + 15));
    }

    #[test]
    fn default_policy_matches_provider_pacing() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.inter_batch_delay, Duration::from_secs(6));
        assert_eq!(policy.rate_limit_delay, Duration::from_secs(15));
        assert_eq!(policy.max_retries_per_batch, 1);
        assert!(BackoffPolicy::immediate().inter_batch_delay.is_zero());
    }
}
