use super::recover::RecoveredCategory;
use crate::bookmark::{SmartCategory, UNCATEGORIZED_ID, UNCATEGORIZED_NAME};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Merge per-batch results into the final category list.
///
/// AI categories keep batch order and get `smart_<index>_<millis>` ids. The
/// trailing "uncategorized" category holds every id no AI category claimed,
/// plus the ids that were bucketed without asking the model. Together the
/// categories cover `all_ids` exactly.
pub fn reconcile(
    all_ids: &[String],
    per_batch: Vec<Vec<RecoveredCategory>>,
    already_bucketable: &HashSet<String>,
    generated_at: DateTime<Utc>,
) -> Vec<SmartCategory> {
    let millis = generated_at.timestamp_millis();
    let mut categorized: HashSet<String> = HashSet::new();

    let mut categories: Vec<SmartCategory> = per_batch
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(index, recovered)| {
            categorized.extend(recovered.bookmark_ids.iter().cloned());
            SmartCategory {
                id: format!("smart_{}_{}", index, millis),
                name: recovered.name,
                bookmark_ids: recovered.bookmark_ids,
                description: recovered.description,
                icon: recovered.icon,
            }
        })
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let uncategorized: Vec<String> = all_ids
        .iter()
        .filter(|id| !categorized.contains(*id) || already_bucketable.contains(*id))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    categories.push(SmartCategory {
        id: UNCATEGORIZED_ID.to_string(),
        name: UNCATEGORIZED_NAME.to_string(),
        bookmark_ids: uncategorized,
        description: None,
        icon: None,
    });
    categories
}
