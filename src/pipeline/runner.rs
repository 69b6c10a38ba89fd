//! Stage runner
//!
//! Drives a [`ResearchSession`] through its stages, persisting every
//! transition before the next stage begins. A session interrupted at any
//! point can be resumed from its last persisted state.

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{merge_plan, ReportWriter, ResearchGenerator};
use crate::aggregate::ResultAggregator;
use crate::config::{PipelineConfig, SchedulerOptions};
use crate::error::{GeneratorError, PipelineError};
use crate::scheduler::TaskScheduler;
use crate::search::{CancelReason, ExecutedSearch, SearchCapability, SearchExecutor, SearchOutcome};
use crate::session::{ResearchSession, SessionRepairer, SessionStore, Stage, SCHEMA_VERSION};

/// Sequences questions → plan → search → write for one session at a time
pub struct PipelineStageRunner {
    store: Arc<SessionStore>,
    scheduler: TaskScheduler,
    aggregator: ResultAggregator,
    generator: Arc<dyn ResearchGenerator>,
    writer: Arc<dyn ReportWriter>,
    repairer: Option<Arc<dyn SessionRepairer>>,
    options: SchedulerOptions,
    max_query_chars: usize,
    generation_timeout: Duration,
    report_timeout: Duration,
    abort: CancellationToken,
}

impl PipelineStageRunner {
    /// Build a runner and its components from `config`
    pub fn new(
        config: &PipelineConfig,
        capability: Arc<dyn SearchCapability>,
        generator: Arc<dyn ResearchGenerator>,
        writer: Arc<dyn ReportWriter>,
    ) -> Self {
        let executor = SearchExecutor::new(capability, config.search.retry.clone());
        Self {
            store: Arc::new(SessionStore::new(&config.data_dir)),
            scheduler: TaskScheduler::new(executor, config.search.call_timeout),
            aggregator: ResultAggregator::new(config.limits),
            generator,
            writer,
            repairer: None,
            options: config.scheduler.clone(),
            max_query_chars: config.search.max_query_chars,
            generation_timeout: config.generation_timeout,
            report_timeout: config.report_timeout,
            abort: CancellationToken::new(),
        }
    }

    /// Share an existing store instead of opening one on `data_dir`
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Repair documents that fail validation on resume
    pub fn with_repairer(mut self, repairer: Arc<dyn SessionRepairer>) -> Self {
        self.repairer = Some(repairer);
        self
    }

    /// Use `token` as the abort signal
    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Token that aborts the running pipeline when cancelled
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Start a new session for `topic` and drive it to completion
    pub async fn run(&self, topic: &str) -> Result<ResearchSession, PipelineError> {
        let session_id = self.store.create(topic).await?;
        info!(session_id = %session_id, "Starting research session");
        let session = self.store.load(&session_id).await?;
        self.drive(session).await
    }

    /// Continue a stored session from its last persisted stage
    pub async fn resume(&self, session_id: &str) -> Result<ResearchSession, PipelineError> {
        let session = match self.store.load(session_id).await {
            Ok(session) => session,
            Err(err) if err.needs_repair() => match &self.repairer {
                Some(repairer) => {
                    warn!(session_id, error = %err, "Session failed validation, attempting repair");
                    let path = self.store.path_for(session_id)?;
                    let mut repaired = repairer.repair(&path).await?;
                    repaired.session_id = session_id.to_string();
                    repaired.schema_version = SCHEMA_VERSION;
                    self.store.save(&mut repaired).await?;
                    repaired
                }
                None => return Err(err.into()),
            },
            Err(err) => return Err(err.into()),
        };

        if session.stage.is_terminal() {
            return Err(PipelineError::Terminal(session.stage));
        }

        info!(session_id, stage = %session.stage, "Resuming research session");
        self.drive(session).await
    }

    async fn drive(&self, mut session: ResearchSession) -> Result<ResearchSession, PipelineError> {
        while !session.stage.is_terminal() {
            let stage = session.stage;
            if self.abort.is_cancelled() {
                info!(session_id = %session.session_id, %stage, "Pipeline aborted");
                return Err(PipelineError::Aborted);
            }

            let outcome = match self.execute_stage(&mut session).await {
                Ok(()) => {
                    session.advance();
                    self.store.save(&mut session).await.map_err(PipelineError::from)
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => info!(
                    session_id = %session.session_id,
                    from = %stage,
                    to = %session.stage,
                    "Stage complete"
                ),
                Err(PipelineError::Aborted) => {
                    info!(session_id = %session.session_id, %stage, "Pipeline aborted");
                    return Err(PipelineError::Aborted);
                }
                Err(err) => {
                    error!(session_id = %session.session_id, %stage, error = %err, "Stage failed");
                    session.fail(err.to_string());
                    if let Err(save_err) = self.store.save(&mut session).await {
                        error!(
                            session_id = %session.session_id,
                            error = %save_err,
                            "Could not persist failed session"
                        );
                    }
                    return Err(err);
                }
            }
        }

        Ok(session)
    }

    async fn execute_stage(&self, session: &mut ResearchSession) -> Result<(), PipelineError> {
        match session.stage {
            Stage::Created => {
                let questions = self
                    .generate(Stage::Created, self.generator.questions(&session.topic))
                    .await?;
                debug!(session_id = %session.session_id, count = questions.len(), "Generated questions");
                session.questions = questions;
                Ok(())
            }
            Stage::QuestionsGenerated => {
                let plan = self
                    .generate(
                        Stage::QuestionsGenerated,
                        self.generator.plan(&session.topic, &session.questions),
                    )
                    .await?;
                let (queries, notices) =
                    merge_plan(&session.topic, plan, &session.questions, self.max_query_chars);
                if queries.is_empty() {
                    return Err(PipelineError::generation(
                        Stage::QuestionsGenerated,
                        GeneratorError::new("plan produced no queries"),
                    ));
                }
                debug!(session_id = %session.session_id, count = queries.len(), "Planned queries");
                session.plan = queries;
                session.results.clear();
                session.notices.extend(notices);
                Ok(())
            }
            Stage::Planned => Ok(()),
            Stage::Searching => self.search(session).await,
            Stage::Writing => self.write_report(session).await,
            Stage::Complete | Stage::Failed => Ok(()),
        }
    }

    /// Await one generator call, bounded by the generation timeout and the abort signal
    async fn generate<T, F>(&self, stage: Stage, call: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, GeneratorError>>,
    {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(PipelineError::Aborted),
            result = tokio::time::timeout(self.generation_timeout, call) => match result {
                Ok(result) => result.map_err(|e| PipelineError::generation(stage, e)),
                Err(_) => {
                    warn!(
                        %stage,
                        timeout_ms = self.generation_timeout.as_millis() as u64,
                        "Generator call timed out"
                    );
                    Err(PipelineError::generation(
                        stage,
                        GeneratorError::new(format!(
                            "no response after {:.1} seconds",
                            self.generation_timeout.as_secs_f64()
                        )),
                    ))
                }
            },
        }
    }

    async fn search(&self, session: &mut ResearchSession) -> Result<(), PipelineError> {
        let pending = session.pending_queries();
        info!(
            session_id = %session.session_id,
            pending = pending.len(),
            planned = session.plan.len(),
            "Submitting searches"
        );

        if !pending.is_empty() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let batch = self
                .scheduler
                .run_with_progress(&pending, &self.options, &self.abort, Some(tx));
            tokio::pin!(batch);

            let executed = loop {
                tokio::select! {
                    Some(item) = rx.recv() => self.record(session, item).await?,
                    executed = &mut batch => break executed,
                }
            };
            while let Some(item) = rx.recv().await {
                self.record(session, item).await?;
            }

            let aborted = executed.iter().any(|e| {
                matches!(
                    e.outcome,
                    SearchOutcome::Cancelled {
                        reason: CancelReason::Aborted
                    }
                )
            });
            if aborted {
                return Err(PipelineError::Aborted);
            }
        }

        let notices = self.aggregator.enforce_total_budget(&mut session.results);
        session.notices.extend(notices);
        Ok(())
    }

    /// Finalize and persist one completed search
    async fn record(&self, session: &mut ResearchSession, item: ExecutedSearch) -> Result<(), PipelineError> {
        // Aborted work is resubmitted on resume
        if matches!(
            item.outcome,
            SearchOutcome::Cancelled {
                reason: CancelReason::Aborted
            }
        ) {
            return Ok(());
        }

        let (result, notices) = self.aggregator.finalize(item);
        debug!(
            session_id = %session.session_id,
            query_id = result.query_id,
            status = ?result.status,
            "Recording search result"
        );
        session.record_result(result);
        session.notices.extend(notices);
        self.store.save(session).await?;
        Ok(())
    }

    async fn write_report(&self, session: &mut ResearchSession) -> Result<(), PipelineError> {
        let mut stream = self.writer.write(&session.topic, &session.results);
        let mut report = String::new();
        let mut chunks = 0usize;
        let deadline = tokio::time::sleep(self.report_timeout);
        tokio::pin!(deadline);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(PipelineError::Aborted),
                _ = &mut deadline => {
                    warn!(
                        session_id = %session.session_id,
                        chunks,
                        timeout_ms = self.report_timeout.as_millis() as u64,
                        "Report stream timed out"
                    );
                    return Err(PipelineError::Report(format!(
                        "report not finished after {:.1} seconds",
                        self.report_timeout.as_secs_f64()
                    )));
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    report.push_str(&chunk.content);
                    chunks += 1;
                }
                Some(Err(err)) => return Err(PipelineError::Report(err.message)),
                None => break,
            }
        }

        debug!(
            session_id = %session.session_id,
            chunks,
            chars = report.chars().count(),
            "Report written"
        );
        session.report = Some(report);
        Ok(())
    }
}
