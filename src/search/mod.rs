//! Search types and the external search capability
//!
//! A search provider is reached only through [`SearchCapability`]. Whatever it
//! returns is resolved into a [`SearchOutcome`] at the executor boundary, so no
//! downstream code inspects provider shapes directly.

pub mod executor;

pub use executor::SearchExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// One search query. `id` is its position in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub id: usize,
    pub text: String,
}

impl Query {
    pub fn new(id: usize, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// Classification of a failed search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    Network,
    ServerError,
    MalformedQuery,
    InvalidCredentials,
    QuotaExhausted,
    MalformedResponse,
    /// The search call panicked or its task died
    Internal,
    Unknown,
}

impl ErrorKind {
    /// Transient failures are eligible for retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Network | Self::ServerError
        )
    }

    /// Fatal failures mean no further search against this provider can succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::QuotaExhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::ServerError => "server_error",
            Self::MalformedQuery => "malformed_query",
            Self::InvalidCredentials => "invalid_credentials",
            Self::QuotaExhausted => "quota_exhausted",
            Self::MalformedResponse => "malformed_response",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure returned by a search capability
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SearchFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl SearchFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCredentials, message)
    }

    pub fn malformed_query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedQuery, message)
    }
}

/// Why a search was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The batch timeout expired
    BatchTimeout,
    /// The caller's abort signal fired
    Aborted,
    /// A fatal provider error stopped the batch
    ProviderHalted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BatchTimeout => "batch timeout exceeded",
            Self::Aborted => "aborted",
            Self::ProviderHalted => "search provider halted after a fatal error",
        })
    }
}

/// Result of one search, resolved at the executor boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Raw payload from the provider; the aggregator turns it into content
    Success { payload: Value },
    Error { kind: ErrorKind, message: String },
    Timeout { after: Duration },
    Cancelled { reason: CancelReason },
}

impl SearchOutcome {
    pub fn status(&self) -> SearchStatus {
        match self {
            Self::Success { .. } => SearchStatus::Success,
            Self::Error { .. } => SearchStatus::Error,
            Self::Timeout { .. } => SearchStatus::Timeout,
            Self::Cancelled { .. } => SearchStatus::Cancelled,
        }
    }

    pub fn is_fatal_error(&self) -> bool {
        matches!(self, Self::Error { kind, .. } if kind.is_fatal())
    }
}

/// Terminal status of a search result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

/// A query together with its outcome, before finalization by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedSearch {
    pub query_id: usize,
    pub query: String,
    pub outcome: SearchOutcome,
    /// Calls made to the capability (0 when cancelled before the first call)
    pub attempts: usize,
}

impl ExecutedSearch {
    pub fn new(query: &Query, outcome: SearchOutcome, attempts: usize) -> Self {
        Self {
            query_id: query.id,
            query: query.text.clone(),
            outcome,
            attempts,
        }
    }

    pub fn cancelled(query: &Query, reason: CancelReason) -> Self {
        Self::new(query, SearchOutcome::Cancelled { reason }, 0)
    }

    pub fn status(&self) -> SearchStatus {
        self.outcome.status()
    }
}

/// Finalized, persisted search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query_id: usize,
    #[serde(default)]
    pub query: String,
    pub status: SearchStatus,
    pub content: String,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Content length in characters before any truncation
    pub original_length: usize,
    pub truncated: bool,
}

/// External search provider
///
/// Implementations perform the actual lookup. They should return
/// [`SearchFailure`] for anything that went wrong; the executor also guards
/// against panics and calls that never finish.
#[async_trait]
pub trait SearchCapability: Send + Sync {
    /// Provider name used in logs
    fn name(&self) -> &str {
        "search"
    }

    /// Run one query. The returned value is normally a JSON string, but any
    /// shape is accepted and coerced later.
    async fn search(&self, query: &str, timeout: Duration) -> Result<Value, SearchFailure>;
}
