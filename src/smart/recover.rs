//! Response recovery
//!
//! Models are asked for a bare JSON array but routinely wrap it in fences,
//! use single quotes, leave trailing commas or stop mid-object when they hit
//! a token limit. [`recover`] runs an ordered chain of increasingly lenient
//! strategies and always returns something usable:
//!
//! 1. direct extraction (with light normalization)
//! 2. structural repair of truncated or comma-less output
//! 3. regex scraping of individual fields
//! 4. one catch-all category holding every submitted id

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Name of the catch-all category used when nothing could be recovered.
pub const FALLBACK_CATEGORY_NAME: &str = "Other";

const WRAPPER_KEYS: [&str; 3] = ["categories", "data", "results"];
const ID_KEYS: [&str; 3] = ["bookmarkIds", "bookmark_ids", "ids"];
const NAME_KEYS: [&str; 2] = ["name", "category"];

/// A category as understood from model output, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredCategory {
    pub name: String,
    pub bookmark_ids: Vec<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
}

/// Turn raw model text into categories. Never fails.
///
/// Ids not in `candidate_ids` are dropped and duplicates removed, so the
/// result only ever references bookmarks that were submitted.
pub fn recover(raw: &str, candidate_ids: &HashSet<String>) -> Vec<RecoveredCategory> {
    let text = strip_markdown_fences(raw);

    let records = if let Some(records) = extract_direct(text) {
        records
    } else if let Some(records) = repair_structure(text) {
        tracing::debug!("recovered categories after structural repair");
        records
    } else if let Some(records) = scrape_fields(text) {
        tracing::debug!(count = records.len(), "recovered categories by field scraping");
        records
    } else {
        tracing::warn!(
            bookmarks = candidate_ids.len(),
            "model output was unusable; grouping the batch under a catch-all category"
        );
        return vec![fallback(candidate_ids)];
    };

    finalize(records, candidate_ids)
}

// ═══════════════════════════════════════════════════════════════════════════
// Stage 1: direct extraction
// ═══════════════════════════════════════════════════════════════════════════

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```JSON"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

fn extract_direct(text: &str) -> Option<Vec<RecoveredCategory>> {
    let mut fragments: Vec<&str> = Vec::new();
    if text.starts_with('{') {
        fragments.push(text);
    }
    if let Some(found) = array_re().and_then(|re| re.find(text)) {
        fragments.push(found.as_str());
    }

    for fragment in fragments {
        if let Some(records) = parse_records(fragment) {
            return Some(records);
        }
        if let Some(records) = parse_records(&normalize_json(fragment)) {
            return Some(records);
        }
    }
    None
}

fn parse_records(json: &str) -> Option<Vec<RecoveredCategory>> {
    let value: Value = serde_json::from_str(json).ok()?;
    records_from_value(&value)
}

/// Accept an array of records (or an object wrapping one). An empty array is
/// a valid "no categories" answer; a non-empty array with no usable records
/// is not.
fn records_from_value(value: &Value) -> Option<Vec<RecoveredCategory>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => WRAPPER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))?,
        _ => return None,
    };
    if items.is_empty() {
        return Some(Vec::new());
    }

    let records: Vec<RecoveredCategory> = items.iter().filter_map(record_from_value).collect();
    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}

fn record_from_value(value: &Value) -> Option<RecoveredCategory> {
    let obj = value.as_object()?;
    let name = NAME_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))?
        .to_string();
    let bookmark_ids = ID_KEYS
        .iter()
        .find_map(|key| obj.get(*key))
        .map(ids_from_value)
        .unwrap_or_default();

    Some(RecoveredCategory {
        name,
        bookmark_ids,
        description: obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        icon: obj.get("icon").and_then(Value::as_str).map(str::to_string),
    })
}

fn ids_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(id_from_value).collect(),
        other => id_from_value(other).into_iter().collect(),
    }
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rewrite common near-JSON into JSON.
///
/// Smart quotes become ASCII, single-quoted strings become double-quoted,
/// raw control characters inside strings are escaped, bare object keys are
/// quoted and trailing commas before `]`/`}` are dropped.
fn normalize_json(text: &str) -> String {
    let chars: Vec<char> = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            match c {
                '\\' => match chars.get(i + 1) {
                    // \' is not a JSON escape
                    Some('\'') => {
                        out.push('\'');
                        i += 1;
                    }
                    Some(next) => {
                        out.push('\\');
                        out.push(*next);
                        i += 1;
                    }
                    None => {}
                },
                c if c == q => {
                    out.push('"');
                    quote = None;
                }
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push('"');
            }
            ',' if matches!(next_significant(&chars, i + 1), Some(']') | Some('}')) => {}
            c if (c.is_ascii_alphabetic() || c == '_')
                && matches!(last_significant(&out), Some('{') | Some(',')) =>
            {
                let end = identifier_end(&chars, i);
                let word: String = chars[i..end].iter().collect();
                if next_significant(&chars, end) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
                i = end;
                continue;
            }
            c => out.push(c),
        }
        i += 1;
    }

    out
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars.iter().skip(from).copied().find(|c| !c.is_whitespace())
}

fn last_significant(out: &str) -> Option<char> {
    out.chars().rev().find(|c| !c.is_whitespace())
}

fn identifier_end(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len()
        && (chars[end].is_ascii_alphanumeric() || matches!(chars[end], '_' | '$'))
    {
        end += 1;
    }
    end
}

// ═══════════════════════════════════════════════════════════════════════════
// Stage 2: structural repair
// ═══════════════════════════════════════════════════════════════════════════

fn repair_structure(text: &str) -> Option<Vec<RecoveredCategory>> {
    let start = text.find('[')?;
    let spaced = insert_missing_commas(&normalize_json(&text[start..]));

    let closed = close_structure(&spaced);
    let repaired = drop_trailing_commas(&fill_empty_values(&closed));
    if let Some(records) = parse_records(&repaired) {
        return Some(records);
    }

    let cut = last_complete_object(&spaced)?;
    parse_records(&drop_trailing_commas(&fill_empty_values(&cut)))
}

fn insert_missing_commas(text: &str) -> String {
    let mut fixed = text.to_string();
    if let Some(re) = object_gap_re() {
        fixed = re.replace_all(&fixed, "},{").into_owned();
    }
    if let Some(re) = array_gap_re() {
        fixed = re.replace_all(&fixed, "],[").into_owned();
    }
    if let Some(re) = property_gap_re() {
        fixed = re.replace_all(&fixed, "\",\n\"").into_owned();
    }
    fixed
}

fn fill_empty_values(text: &str) -> String {
    match empty_value_re() {
        Some(re) => re.replace_all(text, ": null$1").into_owned(),
        None => text.to_string(),
    }
}

fn drop_trailing_commas(text: &str) -> String {
    match trailing_comma_re() {
        Some(re) => re.replace_all(text, "$1").into_owned(),
        None => text.to_string(),
    }
}

/// Close an unterminated string and any brackets left open. Stray closers
/// with nothing to close are dropped.
fn close_structure(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.contains(&c) {
                    while let Some(closer) = stack.pop() {
                        out.push(closer);
                        if closer == c {
                            break;
                        }
                    }
                }
            }
            c => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Cut an array back to its last complete top-level object and close it.
fn last_complete_object(text: &str) -> Option<String> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut last_end: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                if c == '}' && depth == 2 {
                    last_end = Some(i);
                }
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }

    let end = last_end?;
    Some(format!("{}]", &text[..=end]))
}

// ═══════════════════════════════════════════════════════════════════════════
// Stage 3: field scraping
// ═══════════════════════════════════════════════════════════════════════════

/// Scrape the raw reply first. Prose around the objects may hold
/// apostrophes, so single-quote normalization only starts at the first
/// bracket and only when the raw text yields nothing.
fn scrape_fields(text: &str) -> Option<Vec<RecoveredCategory>> {
    let raw = text.replace(['\u{201C}', '\u{201D}'], "\"");
    scrape_text(&raw).or_else(|| {
        let start = text.find(['{', '['])?;
        scrape_text(&normalize_json(&text[start..]))
    })
}

fn scrape_text(text: &str) -> Option<Vec<RecoveredCategory>> {
    let names: Vec<String> = name_field_re()?
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| unescape(m.as_str())))
        .collect();
    if names.is_empty() {
        return None;
    }

    let id_lists: Vec<Vec<String>> = match ids_field_re() {
        Some(re) => re
            .captures_iter(text)
            .map(|caps| {
                caps.get(1)
                    .map(|m| parse_id_list(m.as_str()))
                    .unwrap_or_default()
            })
            .collect(),
        None => Vec::new(),
    };
    let descriptions: Vec<String> = match description_field_re() {
        Some(re) => re
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).map(|m| unescape(m.as_str())))
            .collect(),
        None => Vec::new(),
    };

    Some(
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| RecoveredCategory {
                name,
                bookmark_ids: id_lists.get(i).cloned().unwrap_or_default(),
                description: descriptions.get(i).cloned(),
                icon: None,
            })
            .collect(),
    )
}

fn parse_id_list(inner: &str) -> Vec<String> {
    serde_json::from_str::<Value>(&format!("[{}]", inner))
        .map(|v| ids_from_value(&v))
        .unwrap_or_default()
}

fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// Stage 4 and cleanup
// ═══════════════════════════════════════════════════════════════════════════

fn fallback(candidate_ids: &HashSet<String>) -> RecoveredCategory {
    let mut ids: Vec<String> = candidate_ids.iter().cloned().collect();
    ids.sort();
    RecoveredCategory {
        name: FALLBACK_CATEGORY_NAME.to_string(),
        bookmark_ids: ids,
        description: None,
        icon: None,
    }
}

fn finalize(
    records: Vec<RecoveredCategory>,
    candidate_ids: &HashSet<String>,
) -> Vec<RecoveredCategory> {
    records
        .into_iter()
        .filter_map(|record| {
            let name = record.name.trim();
            if name.is_empty() {
                return None;
            }
            let mut seen: HashSet<String> = HashSet::new();
            let bookmark_ids = record
                .bookmark_ids
                .into_iter()
                .filter(|id| candidate_ids.contains(id) && seen.insert(id.clone()))
                .collect();
            Some(RecoveredCategory {
                name: name.to_string(),
                bookmark_ids,
                description: non_blank(record.description),
                icon: non_blank(record.icon),
            })
        })
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════
// Patterns
// ═══════════════════════════════════════════════════════════════════════════

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn array_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)\[.*\]")
}

fn object_gap_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"\}\s*\{")
}

fn array_gap_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"\]\s*\[")
}

fn property_gap_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#""[ \t]*\r?\n\s*""#)
}

fn empty_value_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r":\s*([,}\]])")
}

fn trailing_comma_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r",\s*([\]}])")
}

fn name_field_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#""name"\s*:\s*"((?:[^"\\]|\\.)*)""#)
}

fn ids_field_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#""(?:bookmarkIds|bookmark_ids|ids)"\s*:\s*\[([^\]]*)\]"#)
}

fn description_field_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#""description"\s*:\s*"((?:[^"\\]|\\.)*)""#)
}
