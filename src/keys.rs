//! Key construction for the single-table storage model.
//!
//! Every persisted entity lives under the owning user's partition key with a
//! kind-prefixed sort key. Construction is pure and deterministic so callers
//! can compute an item's key without a prior lookup, and the `TASK#` sort key
//! embeds the due date so a contiguous lexicographic range equals a date
//! interval, already ordered.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub const PROFILE_SK: &str = "PROFILE";
pub const TASK_PREFIX: &str = "TASK#";
pub const CATEGORY_PREFIX: &str = "CATEGORY#";
pub const INSIGHT_PREFIX: &str = "INSIGHT#";

pub fn user_pk(username: &str) -> String {
    format!("USER#{username}")
}

pub fn task_sk(due_date: NaiveDate, task_id: &str) -> String {
    format!("{TASK_PREFIX}{due_date}#{task_id}")
}

pub fn category_sk(category_id: &str) -> String {
    format!("{CATEGORY_PREFIX}{category_id}")
}

/// Fixed-width millisecond UTC timestamp so lexicographic order on the sort
/// key equals chronological order.
pub fn insight_sk(generated_at: DateTime<Utc>) -> String {
    format!(
        "{INSIGHT_PREFIX}{}",
        generated_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Derive the category id from its display name: trim, lowercase, runs of
/// whitespace collapse to a single hyphen. "Deep Work" and "deep  work" both
/// map to `deep-work`, which is what makes duplicate names a Conflict.
pub fn category_id_from_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Smallest string strictly greater than every key starting with `prefix`.
/// Keys are ASCII by construction, so bumping the final byte is sufficient.
pub fn prefix_upper_bound(prefix: &str) -> String {
    let mut bound = prefix.to_string();
    let last = bound.pop().expect("non-empty key prefix");
    bound.push((last as u8 + 1) as char);
    bound
}

/// Half-open sort-key bounds `[lower, upper)` covering exactly the tasks due
/// in the inclusive date interval `[start, end]`.
pub fn task_range_bounds(start: NaiveDate, end: NaiveDate) -> (String, String) {
    let lower = format!("{TASK_PREFIX}{start}");
    let upper = match end.succ_opt() {
        Some(next) => format!("{TASK_PREFIX}{next}"),
        None => prefix_upper_bound(TASK_PREFIX),
    };
    (lower, upper)
}
