//! Result finalization and content budgets
//!
//! [`ResultAggregator`] turns executor outcomes into persisted
//! [`SearchResult`]s. Payloads of any shape are coerced to text, unsafe
//! characters are stripped, and oversized content is truncated on a character
//! boundary. Every such change is reported as a [`Notice`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::config::ContentLimits;
use crate::search::{ErrorKind, ExecutedSearch, SearchOutcome, SearchResult, SearchStatus};

/// Kind of data-quality event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Content exceeded the per-result limit
    Truncated,
    /// Content was cut to fit the aggregate budget
    AggregateTruncated,
    /// A non-string payload was converted to text
    Coerced,
    /// Control characters were removed
    Sanitized,
    /// Query text was shortened before dispatch
    QueryShortened,
    /// The session document was reconstructed by a repairer
    Repaired,
}

/// Persisted record of a data-quality event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<usize>,
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            query_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_query(query_id: usize, kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            query_id: Some(query_id),
            kind,
            message: message.into(),
        }
    }
}

/// Finalizes search outcomes and enforces content limits
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator {
    limits: ContentLimits,
}

impl ResultAggregator {
    pub fn new(limits: ContentLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ContentLimits {
        self.limits
    }

    /// Finalize every outcome, then apply the aggregate budget.
    pub fn aggregate(&self, executed: Vec<ExecutedSearch>) -> (Vec<SearchResult>, Vec<Notice>) {
        let mut notices = Vec::new();
        let mut results = Vec::with_capacity(executed.len());
        for item in executed {
            let (result, mut item_notices) = self.finalize(item);
            notices.append(&mut item_notices);
            results.push(result);
        }
        notices.extend(self.enforce_total_budget(&mut results));
        (results, notices)
    }

    /// Turn one outcome into a [`SearchResult`], applying the per-result limit.
    pub fn finalize(&self, executed: ExecutedSearch) -> (SearchResult, Vec<Notice>) {
        let ExecutedSearch {
            query_id,
            query,
            outcome,
            ..
        } = executed;
        let mut notices = Vec::new();

        let (status, raw, error_kind) = match outcome {
            SearchOutcome::Success { payload } => {
                let (text, coerced_from) = coerce_payload(payload);
                if let Some(shape) = coerced_from {
                    warn!(query_id, shape, "Coerced non-string search payload");
                    notices.push(Notice::for_query(
                        query_id,
                        NoticeKind::Coerced,
                        format!("coerced {} payload to text", shape),
                    ));
                }
                (SearchStatus::Success, text, None)
            }
            SearchOutcome::Error { kind, message } => (
                SearchStatus::Error,
                format!("[Search for '{}' failed: {}]", query, message),
                Some(kind),
            ),
            SearchOutcome::Timeout { after } => (
                SearchStatus::Timeout,
                format!("[Search for '{}' timed out after {} seconds]", query, seconds(after)),
                Some(ErrorKind::Timeout),
            ),
            SearchOutcome::Cancelled { reason } => (
                SearchStatus::Cancelled,
                format!("[Search for '{}' cancelled: {}]", query, reason),
                None,
            ),
        };

        let (mut content, removed) = sanitize(raw);
        if removed > 0 {
            warn!(query_id, removed, "Stripped control characters from search content");
            notices.push(Notice::for_query(
                query_id,
                NoticeKind::Sanitized,
                format!("removed {} control characters", removed),
            ));
        }

        let original_length = content.chars().count();
        let mut truncated = false;
        if original_length > self.limits.max_result_chars {
            let keep = truncate_chars(&content, self.limits.max_result_chars).len();
            content.truncate(keep);
            truncated = true;
            warn!(
                query_id,
                original_length,
                limit = self.limits.max_result_chars,
                "Truncated oversized search result"
            );
            notices.push(Notice::for_query(
                query_id,
                NoticeKind::Truncated,
                format!(
                    "content truncated from {} to {} characters",
                    original_length, self.limits.max_result_chars
                ),
            ));
        }

        let result = SearchResult {
            query_id,
            query,
            status,
            content,
            error_kind,
            original_length,
            truncated,
        };
        (result, notices)
    }

    /// Cut content, in submission order, until the total fits
    /// `max_total_chars`. Successful content gives way first. Failure markers
    /// are only cut when they alone exceed the budget.
    pub fn enforce_total_budget(&self, results: &mut [SearchResult]) -> Vec<Notice> {
        let total: usize = results.iter().map(|r| r.content.chars().count()).sum();
        if total <= self.limits.max_total_chars {
            return Vec::new();
        }

        let markers: usize = results
            .iter()
            .filter(|r| r.status != SearchStatus::Success)
            .map(|r| r.content.chars().count())
            .sum();
        let mut notices = Vec::new();

        let mut remaining = self.limits.max_total_chars.saturating_sub(markers);
        for result in results.iter_mut().filter(|r| r.status == SearchStatus::Success) {
            remaining = self.fit(result, remaining, &mut notices);
        }

        if markers > self.limits.max_total_chars {
            let mut remaining = self.limits.max_total_chars;
            for result in results.iter_mut().filter(|r| r.status != SearchStatus::Success) {
                remaining = self.fit(result, remaining, &mut notices);
            }
        }

        notices
    }

    /// Cut `result` to at most `budget` characters, returning the budget left
    fn fit(&self, result: &mut SearchResult, budget: usize, notices: &mut Vec<Notice>) -> usize {
        let len = result.content.chars().count();
        if len <= budget {
            return budget - len;
        }

        let keep = truncate_chars(&result.content, budget).len();
        result.content.truncate(keep);
        result.truncated = true;
        warn!(
            query_id = result.query_id,
            status = ?result.status,
            kept = budget,
            dropped = len - budget,
            "Truncated search result to fit aggregate budget"
        );
        notices.push(Notice::for_query(
            result.query_id,
            NoticeKind::AggregateTruncated,
            format!(
                "content cut from {} to {} characters to fit the {} character total",
                len, budget, self.limits.max_total_chars
            ),
        ));
        0
    }
}

/// Longest prefix of `s` holding at most `max` characters
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Text form of a payload, plus the shape name when it was not already a string
fn coerce_payload(payload: Value) -> (String, Option<&'static str>) {
    match payload {
        Value::String(s) => (s, None),
        Value::Object(mut map) => match map.remove("content") {
            Some(Value::String(s)) => (s, Some("object")),
            Some(other) => {
                map.insert("content".to_string(), other);
                (Value::Object(map).to_string(), Some("object"))
            }
            None => (Value::Object(map).to_string(), Some("object")),
        },
        Value::Array(items) => (Value::Array(items).to_string(), Some("array")),
        Value::Number(n) => (n.to_string(), Some("number")),
        Value::Bool(b) => (b.to_string(), Some("boolean")),
        Value::Null => (String::new(), Some("null")),
    }
}

/// Strip NUL and non-whitespace control characters, returning how many were removed
fn sanitize(text: String) -> (String, usize) {
    let unsafe_char = |c: char| c.is_control() && !c.is_whitespace();
    if !text.chars().any(unsafe_char) {
        return (text, 0);
    }
    let mut removed = 0;
    let clean = text
        .chars()
        .filter(|&c| {
            let drop = unsafe_char(c);
            removed += usize::from(drop);
            !drop
        })
        .collect();
    (clean, removed)
}

fn seconds(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.1}", d.as_secs_f64())
    }
}
