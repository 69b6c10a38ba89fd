//! Plan merging

use std::collections::HashSet;
use tracing::warn;

use crate::aggregate::{truncate_chars, Notice, NoticeKind};
use crate::search::Query;

const TOPIC_PLACEHOLDER: &str = "{topic}";

/// Combine planned queries with the generated questions into the ordered
/// query list.
///
/// `{topic}` placeholders are substituted, blank and case-insensitive duplicate
/// entries are dropped, questions already present in the plan are skipped,
/// and text longer than `max_query_chars` is shortened. Ids follow position.
pub fn merge_plan(
    topic: &str,
    plan: Vec<String>,
    questions: &[String],
    max_query_chars: usize,
) -> (Vec<Query>, Vec<Notice>) {
    let mut seen = HashSet::new();
    let mut queries = Vec::new();
    let mut notices = Vec::new();

    let candidates = plan
        .into_iter()
        .map(|text| text.replace(TOPIC_PLACEHOLDER, topic))
        .chain(questions.iter().cloned());

    for text in candidates {
        let text = text.trim();
        if text.is_empty() || !seen.insert(text.to_lowercase()) {
            continue;
        }

        let id = queries.len();
        let length = text.chars().count();
        let text = if length > max_query_chars {
            warn!(query_id = id, length, limit = max_query_chars, "Shortening over-long query");
            notices.push(Notice::for_query(
                id,
                NoticeKind::QueryShortened,
                format!("query shortened from {} to {} characters", length, max_query_chars),
            ));
            truncate_chars(text, max_query_chars).trim_end()
        } else {
            text
        };
        queries.push(Query::new(id, text));
    }

    (queries, notices)
}
