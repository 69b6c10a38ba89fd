//! # research-orchestrator
//!
//! Concurrent search orchestration and resumable research sessions.
//!
//! A research run moves a topic through question generation, search planning,
//! concurrent search execution and report writing. Content generation and the
//! search provider itself are supplied by the caller through traits; this
//! crate handles the parts that have to be right regardless of provider:
//!
//! - bounded parallelism with per-task and whole-batch timeouts
//! - retry of transient failures with exponential backoff
//! - partial-failure recovery without losing gathered results
//! - safe truncation and sanitization of oversized payloads
//! - atomic, versioned session persistence with resume from any stage
//!
//! ## Modules
//!
//! - [`search`]: query and outcome types, the [`SearchCapability`] trait and
//!   the single-query [`SearchExecutor`]
//! - [`scheduler`]: the bounded-concurrency [`TaskScheduler`]
//! - [`aggregate`]: [`ResultAggregator`] and data-quality [`Notice`]s
//! - [`session`]: [`ResearchSession`], [`SessionStore`] and repair
//! - [`pipeline`]: the [`PipelineStageRunner`] and generation collaborators
//! - [`config`]: [`PipelineConfig`] and component options
//! - [`error`]: error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use research_orchestrator::prelude::*;
//!
//! # async fn example(
//! #     search: Arc<dyn SearchCapability>,
//! #     generator: Arc<dyn ResearchGenerator>,
//! #     writer: Arc<dyn ReportWriter>,
//! # ) -> Result<(), PipelineError> {
//! let config = PipelineConfig::default().with_data_dir("research_data");
//! let runner = PipelineStageRunner::new(&config, search, generator, writer)
//!     .with_repairer(Arc::new(SalvageRepairer::new()));
//!
//! let session = runner.run("solid state batteries").await?;
//! println!("{}", session.report.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod search;
pub mod session;

pub use aggregate::{Notice, NoticeKind, ResultAggregator};
pub use config::{ContentLimits, PipelineConfig, RetryPolicy, SchedulerOptions, SearchConfig};
pub use error::{ConfigError, GeneratorError, Irrecoverable, PipelineError, StoreError};
pub use pipeline::{
    merge_plan, PipelineStageRunner, ReportChunk, ReportStream, ReportWriter, ResearchGenerator,
};
pub use scheduler::TaskScheduler;
pub use search::{
    CancelReason, ErrorKind, ExecutedSearch, Query, SearchCapability, SearchExecutor,
    SearchFailure, SearchOutcome, SearchResult, SearchStatus,
};
pub use session::{
    ResearchSession, SalvageRepairer, SessionRepairer, SessionStore, SessionSummary, Stage,
    SCHEMA_VERSION,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::aggregate::{Notice, NoticeKind, ResultAggregator};
    pub use crate::config::{ContentLimits, PipelineConfig, RetryPolicy, SchedulerOptions};
    pub use crate::error::{GeneratorError, PipelineError, StoreError};
    pub use crate::pipeline::{
        PipelineStageRunner, ReportChunk, ReportStream, ReportWriter, ResearchGenerator,
    };
    pub use crate::scheduler::TaskScheduler;
    pub use crate::search::{
        ErrorKind, Query, SearchCapability, SearchExecutor, SearchFailure, SearchResult,
        SearchStatus,
    };
    pub use crate::session::{ResearchSession, SalvageRepairer, SessionRepairer, SessionStore, Stage};
}
