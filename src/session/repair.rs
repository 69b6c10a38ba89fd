//! Session repair
//!
//! When a document fails schema validation or cannot be parsed, the pipeline
//! hands its path to a [`SessionRepairer`]. [`SalvageRepairer`] keeps whatever
//! can still be trusted and picks the resume stage from what survived.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use super::store::session_id_from_path;
use super::{ResearchSession, Stage};
use crate::aggregate::{Notice, NoticeKind};
use crate::error::Irrecoverable;
use crate::search::{ErrorKind, Query, SearchResult, SearchStatus};

const TOPIC_PATTERN: &str = r#""(?:topic|query)"\s*:\s*"((?:[^"\\]|\\.)*)""#;

/// Reconstructs a session from a document that failed validation
#[async_trait]
pub trait SessionRepairer: Send + Sync {
    async fn repair(&self, path: &Path) -> Result<ResearchSession, Irrecoverable>;
}

/// Best-effort repairer for damaged or outdated session documents.
///
/// Recovers the topic (or the legacy `query` field), questions, plan and every
/// individually decodable result. Documents that are not JSON at all keep only
/// their topic and restart from `created`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SalvageRepairer;

impl SalvageRepairer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionRepairer for SalvageRepairer {
    async fn repair(&self, path: &Path) -> Result<ResearchSession, Irrecoverable> {
        let session_id = session_id_from_path(path)
            .ok_or_else(|| Irrecoverable::new(path, "not a session document path"))?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Irrecoverable::new(path, format!("unreadable: {}", e)))?;
        let text = String::from_utf8_lossy(&bytes);

        let session = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(doc)) => salvage_document(&session_id, &doc),
            _ => salvage_topic(&session_id, &text),
        }
        .ok_or_else(|| Irrecoverable::new(path, "no topic could be recovered"))?;

        info!(
            session_id = %session.session_id,
            stage = %session.stage,
            queries = session.plan.len(),
            results = session.results.len(),
            "Repaired session document"
        );
        Ok(session)
    }
}

fn salvage_document(session_id: &str, doc: &Map<String, Value>) -> Option<ResearchSession> {
    let topic = ["topic", "query"]
        .iter()
        .find_map(|key| non_empty_str(doc.get(*key)))?;
    let mut session = ResearchSession::new(session_id, topic);

    if let Some(created) = ["created_at", "timestamp"]
        .iter()
        .find_map(|key| doc.get(*key).and_then(Value::as_str).and_then(parse_timestamp))
    {
        session.created_at = created;
    }

    session.questions = ["questions", "research_questions"]
        .iter()
        .find_map(|key| doc.get(*key).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(|q| non_empty_str(Some(q))).collect())
        .unwrap_or_default();

    session.plan = plan_texts(doc)
        .into_iter()
        .enumerate()
        .map(|(id, text)| Query::new(id, text))
        .collect();

    let mut dropped = 0;
    for result in salvage_results(doc, &session.plan, &mut dropped) {
        session.record_result(result);
    }

    session.report = match doc.get("report") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(report)) => ["content", "report"]
            .iter()
            .find_map(|key| non_empty_str(report.get(*key))),
        _ => None,
    };

    if let Some(items) = doc.get("notices").and_then(Value::as_array) {
        session.notices = items
            .iter()
            .filter_map(|n| serde_json::from_value(n.clone()).ok())
            .collect();
    }

    session.stage = resume_stage(&session);
    if dropped > 0 {
        warn!(session_id, dropped, "Dropped undecodable results during repair");
    }
    session.notices.push(Notice::new(
        NoticeKind::Repaired,
        format!(
            "recovered {} questions, {} planned queries and {} results ({} dropped); resuming at {}",
            session.questions.len(),
            session.plan.len(),
            session.results.len(),
            dropped,
            session.stage
        ),
    ));
    Some(session)
}

/// Unparseable document: recover the topic text only
fn salvage_topic(session_id: &str, text: &str) -> Option<ResearchSession> {
    let pattern = Regex::new(TOPIC_PATTERN).ok()?;
    let raw = pattern.captures(text)?.get(1)?.as_str();
    let topic = serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string());
    if topic.trim().is_empty() {
        return None;
    }

    let mut session = ResearchSession::new(session_id, topic);
    session.notices.push(Notice::new(
        NoticeKind::Repaired,
        "document was not valid JSON; recovered the topic and restarted from created",
    ));
    Some(session)
}

fn plan_texts(doc: &Map<String, Value>) -> Vec<String> {
    let items = match doc.get("plan") {
        Some(Value::Array(items)) => items.as_slice(),
        _ => match doc.get("search_plan") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Object(plan)) => match ["queries", "search_queries"]
                .iter()
                .find_map(|key| plan.get(*key).and_then(Value::as_array))
            {
                Some(items) => items.as_slice(),
                None => return Vec::new(),
            },
            _ => return Vec::new(),
        },
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(query) => ["text", "query"]
                .iter()
                .find_map(|key| non_empty_str(query.get(*key))),
            other => non_empty_str(Some(other)),
        })
        .collect()
}

fn salvage_results(doc: &Map<String, Value>, plan: &[Query], dropped: &mut usize) -> Vec<SearchResult> {
    let mut salvaged = Vec::new();

    if let Some(items) = doc.get("results").and_then(Value::as_array) {
        for item in items {
            let result = serde_json::from_value::<SearchResult>(item.clone())
                .ok()
                .or_else(|| coerce_result(item));
            match result {
                Some(result) if plan.iter().any(|q| q.id == result.query_id) => salvaged.push(result),
                _ => *dropped += 1,
            }
        }
    } else if let Some(items) = doc.get("search_results").and_then(Value::as_array) {
        // Legacy layout: one entry per plan query, by position
        for (idx, item) in items.iter().enumerate() {
            match plan.get(idx) {
                Some(query) => salvaged.push(legacy_result(query, item)),
                None => *dropped += 1,
            }
        }
    }

    salvaged
}

/// A result object whose content is not a string
fn coerce_result(item: &Value) -> Option<SearchResult> {
    let obj = item.as_object()?;
    let query_id = usize::try_from(obj.get("query_id")?.as_u64()?).ok()?;
    let content = text_of(obj.get("content")?);
    let status = obj
        .get("status")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or(SearchStatus::Success);
    let error_kind = obj
        .get("error_kind")
        .and_then(|k| serde_json::from_value(k.clone()).ok());

    Some(SearchResult {
        query_id,
        query: obj
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status,
        original_length: content.chars().count(),
        content,
        error_kind,
        truncated: false,
    })
}

fn legacy_result(query: &Query, item: &Value) -> SearchResult {
    let content = text_of(item);
    let failed = content.starts_with("[Search error") || content.starts_with("[Search for");
    SearchResult {
        query_id: query.id,
        query: query.text.clone(),
        status: if failed {
            SearchStatus::Error
        } else {
            SearchStatus::Success
        },
        error_kind: failed.then_some(ErrorKind::Unknown),
        original_length: content.chars().count(),
        content,
        truncated: false,
    }
}

/// First stage not covered by the salvaged data
fn resume_stage(session: &ResearchSession) -> Stage {
    if session.report.is_some() {
        Stage::Complete
    } else if !session.plan.is_empty() {
        if session.is_search_complete() {
            Stage::Writing
        } else if session.results.is_empty() {
            Stage::Planned
        } else {
            Stage::Searching
        }
    } else if !session.questions.is_empty() {
        Stage::QuestionsGenerated
    } else {
        Stage::Created
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}
