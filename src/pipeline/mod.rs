//! Research pipeline
//!
//! The stage runner drives a session through question generation, planning,
//! search and report writing. Content generation is delegated to the
//! [`ResearchGenerator`] and [`ReportWriter`] collaborators.

pub mod plan;
pub mod runner;

pub use plan::merge_plan;
pub use runner::PipelineStageRunner;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::GeneratorError;
use crate::search::SearchResult;

/// Produces research questions and search plans
#[async_trait]
pub trait ResearchGenerator: Send + Sync {
    /// Questions worth answering about `topic`
    async fn questions(&self, topic: &str) -> Result<Vec<String>, GeneratorError>;

    /// Search query text for `topic`. Entries may contain a `{topic}` placeholder.
    async fn plan(&self, topic: &str, questions: &[String]) -> Result<Vec<String>, GeneratorError>;
}

/// Fragment of a streamed report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportChunk {
    pub content: String,
}

impl ReportChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Stream of report chunks from a [`ReportWriter`]
pub struct ReportStream {
    inner: Pin<Box<dyn Stream<Item = Result<ReportChunk, GeneratorError>> + Send>>,
}

impl ReportStream {
    /// Create a new stream from any compatible async stream
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<ReportChunk, GeneratorError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Stream holding a single, complete report
    pub fn from_complete(report: impl Into<String>) -> Self {
        let chunk = ReportChunk::new(report);
        Self::new(futures::stream::once(async move { Ok(chunk) }))
    }
}

impl Stream for ReportStream {
    type Item = Result<ReportChunk, GeneratorError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Writes the final report from aggregated results
pub trait ReportWriter: Send + Sync {
    fn write(&self, topic: &str, results: &[SearchResult]) -> ReportStream;
}
