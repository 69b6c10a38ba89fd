//! Research sessions
//!
//! A [`ResearchSession`] is the persisted state of one end-to-end research run.
//! It moves through [`Stage`]s in order:
//!
//! ```text
//! created → questions_generated → planned → searching → writing → complete
//!     └──────────────┴──────────────┴───────────┴──────────┴──→ failed
//! ```
//!
//! [`SessionStore`] is the only component that reads or writes session files.

pub mod repair;
pub mod store;

pub use repair::{SalvageRepairer, SessionRepairer};
pub use store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::aggregate::Notice;
use crate::search::{Query, SearchResult};

/// Version of the session document layout
pub const SCHEMA_VERSION: u32 = 1;

/// Pipeline stage of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    QuestionsGenerated,
    Planned,
    Searching,
    Writing,
    Complete,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::QuestionsGenerated => "questions_generated",
            Self::Planned => "planned",
            Self::Searching => "searching",
            Self::Writing => "writing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Terminal stages are never resumed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// The stage that follows on success, if any
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Created => Some(Self::QuestionsGenerated),
            Self::QuestionsGenerated => Some(Self::Planned),
            Self::Planned => Some(Self::Searching),
            Self::Searching => Some(Self::Writing),
            Self::Writing => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one research run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSession {
    pub session_id: String,
    pub topic: String,
    pub schema_version: u32,
    pub stage: Stage,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub plan: Vec<Query>,
    /// Terminal results, kept sorted by `query_id`
    #[serde(default)]
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub notices: Vec<Notice>,
    /// Message of the error that moved the session to `failed`
    #[serde(default)]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchSession {
    pub fn new(session_id: impl Into<String>, topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            topic: topic.into(),
            schema_version: SCHEMA_VERSION,
            stage: Stage::Created,
            questions: Vec::new(),
            plan: Vec::new(),
            results: Vec::new(),
            report: None,
            notices: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to the next stage. Has no effect on terminal sessions.
    pub fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            self.stage = next;
        }
    }

    /// Mark the session failed, recording why
    pub fn fail(&mut self, message: impl Into<String>) {
        self.stage = Stage::Failed;
        self.failure = Some(message.into());
    }

    /// Plan queries that have no terminal result yet
    pub fn pending_queries(&self) -> Vec<Query> {
        let done: HashSet<usize> = self.results.iter().map(|r| r.query_id).collect();
        self.plan
            .iter()
            .filter(|q| !done.contains(&q.id))
            .cloned()
            .collect()
    }

    /// Insert or replace the result for its query, keeping `results` ordered
    pub fn record_result(&mut self, result: SearchResult) {
        match self
            .results
            .binary_search_by_key(&result.query_id, |r| r.query_id)
        {
            Ok(idx) => self.results[idx] = result,
            Err(idx) => self.results.insert(idx, result),
        }
    }

    /// Every plan query has a terminal result
    pub fn is_search_complete(&self) -> bool {
        self.pending_queries().is_empty()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            topic: self.topic.clone(),
            stage: self.stage,
            queries: self.plan.len(),
            results: self.results.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a stored session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub topic: String,
    pub stage: Stage,
    pub queries: usize,
    pub results: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchStatus;

    fn result(id: usize) -> SearchResult {
        SearchResult {
            query_id: id,
            query: format!("q{}", id),
            status: SearchStatus::Success,
            content: "text".into(),
            error_kind: None,
            original_length: 4,
            truncated: false,
        }
    }

    #[test]
    fn test_stage_progression() {
        let mut session = ResearchSession::new("s", "topic");
        let mut seen = vec![session.stage];
        while !session.stage.is_terminal() {
            session.advance();
            seen.push(session.stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::Created,
                Stage::QuestionsGenerated,
                Stage::Planned,
                Stage::Searching,
                Stage::Writing,
                Stage::Complete
            ]
        );
        session.advance();
        assert_eq!(session.stage, Stage::Complete);
    }

    #[test]
    fn test_stage_serialization() {
        assert_eq!(
            serde_json::to_value(Stage::QuestionsGenerated).unwrap(),
            "questions_generated"
        );
        assert_eq!(Stage::Searching.to_string(), "searching");
    }

    #[test]
    fn test_pending_queries_skip_terminal_results() {
        let mut session = ResearchSession::new("s", "topic");
        session.plan = (0..5).map(|i| Query::new(i, format!("q{}", i))).collect();
        session.record_result(result(3));
        session.record_result(result(0));

        let pending: Vec<usize> = session.pending_queries().iter().map(|q| q.id).collect();
        assert_eq!(pending, vec![1, 2, 4]);
        assert!(!session.is_search_complete());
        assert_eq!(
            session.results.iter().map(|r| r.query_id).collect::<Vec<_>>(),
            vec![0, 3]
        );
    }

    #[test]
    fn test_record_result_replaces_existing() {
        let mut session = ResearchSession::new("s", "topic");
        session.record_result(result(1));
        let mut replacement = result(1);
        replacement.content = "newer".into();
        session.record_result(replacement);

        assert_eq!(session.results.len(), 1);
        assert_eq!(session.results[0].content, "newer");
    }

    #[test]
    fn test_fail_records_message() {
        let mut session = ResearchSession::new("s", "topic");
        session.fail("provider down");
        assert_eq!(session.stage, Stage::Failed);
        assert_eq!(session.failure.as_deref(), Some("provider down"));
        assert!(session.stage.is_terminal());
    }
}
