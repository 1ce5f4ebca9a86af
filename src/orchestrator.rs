//! Multi-source orchestration.
//!
//! [`SyncOrchestrator::run`] owns the lifecycle of one [`SyncRun`]:
//!
//! 1. Select enabled sources, narrowed by an optional filter.
//! 2. Create the run row and initialize the one sink shared by all sources.
//! 3. Sync every source, either as concurrent tasks (`parallel`) or one
//!    after another in configuration order (`sequential`).
//! 4. Merge per-source stats, pick the terminal status, persist the run
//!    once, and release the sink.
//!
//! A source that fails fatally never stops its siblings, in either mode.
//! The run always reaches `completed` or `failed`; only a repository failure
//! while creating or finalizing the run row surfaces as an `Err`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::detect::ChangeDetector;
use crate::error::{SourceError, SourceFailure};
use crate::models::{RunStatus, SourceDefinition, SourceStats, SyncMode, SyncRun};
use crate::progress::{NoProgress, SyncProgressReporter};
use crate::repository::Repository;
use crate::source_sync::SourceSyncUnit;
use crate::traits::{Sink, SourceFactory};

/// Per-run parameters.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Upper bound on concurrently running sources in parallel mode. Zero is
    /// treated as one.
    pub max_concurrency: Option<usize>,
    /// Overall deadline; sources still running when it expires stop at their
    /// next read or change boundary and count as failed.
    pub deadline: Option<Duration>,
    /// Restrict the run to these source ids.
    pub source_filter: Option<Vec<String>>,
}

type Outcome = (String, Result<SourceStats, SourceFailure>);

/// Collaborators shared by every source task of a run.
#[derive(Clone)]
struct Shared {
    repository: Arc<dyn Repository>,
    sources: Arc<SourceFactory>,
    detector: Arc<ChangeDetector>,
    progress: Arc<dyn SyncProgressReporter>,
}

/// Coordinates source syncs for a knowledge base.
pub struct SyncOrchestrator {
    shared: Shared,
}

impl SyncOrchestrator {
    pub fn new(repository: Arc<dyn Repository>, sources: SourceFactory) -> Self {
        Self {
            shared: Shared {
                repository,
                sources: Arc::new(sources),
                detector: Arc::new(ChangeDetector::default()),
                progress: Arc::new(NoProgress),
            },
        }
    }

    pub fn with_detector(mut self, detector: ChangeDetector) -> Self {
        self.shared.detector = Arc::new(detector);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.shared.progress = progress;
        self
    }

    /// Enabled sources in configuration order, narrowed by `filter`.
    ///
    /// Repeated source ids are skipped after their first occurrence.
    pub fn select_sources<'s>(
        sources: &'s [SourceDefinition],
        filter: Option<&[String]>,
    ) -> Vec<&'s SourceDefinition> {
        let mut seen = HashSet::new();
        sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| filter.map_or(true, |f| f.iter().any(|id| id == &s.source_id)))
            .filter(|s| {
                let first = seen.insert(s.source_id.as_str());
                if !first {
                    tracing::warn!(source_id = %s.source_id, "duplicate source id, skipping");
                }
                first
            })
            .collect()
    }

    /// Sync `sources` of `knowledge_base` into `sink` and return the finalized run.
    pub async fn run(
        &self,
        knowledge_base: &str,
        sources: &[SourceDefinition],
        sink: Arc<dyn Sink>,
        options: &SyncOptions,
    ) -> Result<SyncRun> {
        let selected = Self::select_sources(sources, options.source_filter.as_deref());

        let start = Utc::now();
        let run_id = self
            .shared
            .repository
            .create_sync_run(knowledge_base, options.mode, start)
            .await?;
        let mut run = SyncRun::start(run_id, knowledge_base, options.mode, start);
        run.sources_processed = selected.iter().map(|s| s.source_id.clone()).collect();

        tracing::info!(
            run_id,
            knowledge_base,
            mode = options.mode.as_str(),
            sources = selected.len(),
            "sync run started"
        );

        let cancel = CancellationToken::new();
        let deadline_guard = options.deadline.map(|deadline| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                tracing::warn!(?deadline, "run deadline expired, cancelling sources");
                token.cancel();
            })
        });

        let outcomes = match sink.initialize().await {
            Ok(()) => match options.mode {
                SyncMode::Parallel => {
                    self.run_parallel(knowledge_base, &selected, &sink, options, &cancel)
                        .await
                }
                SyncMode::Sequential => {
                    self.run_sequential(knowledge_base, &selected, &sink, &cancel)
                        .await
                }
            },
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "sink initialization failed");
                let reason = format!("{:#}", e);
                selected
                    .iter()
                    .map(|s| {
                        let failure: SourceFailure =
                            SourceError::SinkUnavailable(reason.clone()).into();
                        (s.source_id.clone(), Err(failure))
                    })
                    .collect()
            }
        };

        if let Err(e) = sink.cleanup().await {
            tracing::warn!(error = %format!("{:#}", e), "sink cleanup failed");
        }
        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        finalize(&mut run, outcomes);
        self.shared.repository.finalize_sync_run(&run).await?;

        tracing::info!(
            run_id,
            status = run.status.as_str(),
            processed = run.totals.processed,
            new = run.totals.new,
            modified = run.totals.modified,
            deleted = run.totals.deleted,
            errors = run.totals.errors,
            "sync run finished"
        );

        Ok(run)
    }

    async fn run_parallel(
        &self,
        knowledge_base: &str,
        selected: &[&SourceDefinition],
        sink: &Arc<dyn Sink>,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Vec<Outcome> {
        let limit = concurrency_limit(options.max_concurrency);

        let handles: Vec<_> = selected
            .iter()
            .map(|definition| {
                let handle =
                    self.spawn_source(knowledge_base, definition, sink, cancel, limit.clone());
                (definition.source_id.clone(), handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (source_id, handle) in handles {
            outcomes.push((source_id, joined(handle).await));
        }
        outcomes
    }

    /// One source at a time, in configuration order. Each still runs in its
    /// own task so a panicking connector fails only that source.
    async fn run_sequential(
        &self,
        knowledge_base: &str,
        selected: &[&SourceDefinition],
        sink: &Arc<dyn Sink>,
        cancel: &CancellationToken,
    ) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(selected.len());
        for definition in selected {
            let handle = self.spawn_source(knowledge_base, definition, sink, cancel, None);
            outcomes.push((definition.source_id.clone(), joined(handle).await));
        }
        outcomes
    }

    fn spawn_source(
        &self,
        knowledge_base: &str,
        definition: &SourceDefinition,
        sink: &Arc<dyn Sink>,
        cancel: &CancellationToken,
        limit: Option<Arc<Semaphore>>,
    ) -> JoinHandle<Result<SourceStats, SourceFailure>> {
        let shared = self.shared.clone();
        let knowledge_base = knowledge_base.to_string();
        let definition = definition.clone();
        let sink = Arc::clone(sink);
        let cancel = cancel.clone();
        let span = source_span(&knowledge_base, &definition.source_id);

        tokio::spawn(
            async move {
                run_limited(shared, knowledge_base, definition, sink, cancel, limit).await
            }
            .instrument(span),
        )
    }
}

/// Semaphore bounding parallel sources. A bound of zero would never hand out
/// a permit, so it is raised to one.
fn concurrency_limit(max_concurrency: Option<usize>) -> Option<Arc<Semaphore>> {
    max_concurrency.map(|n| {
        if n == 0 {
            tracing::warn!("max_concurrency of 0 treated as 1");
        }
        Arc::new(Semaphore::new(n.max(1)))
    })
}

async fn joined(
    handle: JoinHandle<Result<SourceStats, SourceFailure>>,
) -> Result<SourceStats, SourceFailure> {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => Err(SourceError::Panicked(e.to_string()).into()),
    }
}

fn source_span(knowledge_base: &str, source_id: &str) -> tracing::Span {
    tracing::info_span!("source_sync", knowledge_base = %knowledge_base, source_id = %source_id)
}

async fn run_limited(
    shared: Shared,
    knowledge_base: String,
    definition: SourceDefinition,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
    limit: Option<Arc<Semaphore>>,
) -> Result<SourceStats, SourceFailure> {
    let _permit = match limit {
        Some(semaphore) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled.into()),
            permit = semaphore.acquire_owned() => {
                Some(permit.map_err(|_| SourceFailure::from(SourceError::Cancelled))?)
            }
        },
        None => None,
    };

    sync_source(&shared, &knowledge_base, &definition, sink.as_ref(), cancel).await
}

/// Build the connector, load prior state, and run one [`SourceSyncUnit`].
async fn sync_source(
    shared: &Shared,
    knowledge_base: &str,
    definition: &SourceDefinition,
    sink: &dyn Sink,
    cancel: CancellationToken,
) -> Result<SourceStats, SourceFailure> {
    let source = match shared.sources.create(definition) {
        Ok(Some(source)) => source,
        Ok(None) => {
            return Err(SourceError::UnknownSourceType(definition.source_type.clone()).into())
        }
        Err(e) => return Err(SourceError::Initialize(e).into()),
    };

    let prior = shared
        .repository
        .prior_file_records(knowledge_base, Some(&definition.source_id))
        .await
        .map_err(SourceError::PriorState)?;

    SourceSyncUnit::new(
        knowledge_base,
        definition,
        shared.repository.as_ref(),
        shared.detector.as_ref(),
    )
    .with_progress(shared.progress.as_ref())
    .with_cancellation(cancel)
    .sync(source.as_ref(), sink, &prior)
    .await
}

/// Merge outcomes into `run` and set its terminal status.
fn finalize(run: &mut SyncRun, outcomes: Vec<Outcome>) {
    let mut failures = Vec::new();

    for (source_id, outcome) in outcomes {
        let stats = match outcome {
            Ok(stats) => stats,
            Err(failure) => {
                tracing::error!(source_id = %source_id, error = %failure.error, "source failed");
                failures.push(format!("{}: {}", source_id, failure.error));
                run.source_errors
                    .insert(source_id.clone(), failure.error.to_string());
                failure.stats
            }
        };
        run.totals.merge(&stats);
        run.per_source_stats.insert(source_id, stats);
    }

    run.end_time = Some(Utc::now());
    if failures.is_empty() {
        run.status = RunStatus::Completed;
    } else {
        run.status = RunStatus::Failed;
        run.error_message = Some(format!(
            "{} of {} sources failed: {}",
            failures.len(),
            run.sources_processed.len(),
            failures.join("; ")
        ));
    }
}
