use arrow::array::AsArray;
use arrow::datatypes::Int64Type;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{BatchAccumulator, FlushReason, FlushTrigger};
use crate::config::{IngestConfig, RetrievalConfig, RetrievalMode};
use crate::errors::{ConfigError, IngestionError, SourceError};
use crate::hydration::RehydrationDedupFilter;
use crate::normalize::SchemaNormalizer;
use crate::record::Record;
use crate::schema::FixedSchema;
use crate::sink::{FlushContext, SinkCoordinator};
use crate::snowflake::{self, KNOWN_MACHINE_IDS};
use crate::source::Source;
use crate::telemetry::IngestMetrics;
use crate::window::{self, Window};

/// Loop parameters, usually taken from [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub job_name: String,
    pub query: String,
    pub stride: chrono::Duration,
    pub rowgroup_rows: usize,
    pub sample_interval: Option<Duration>,
    pub hydration_batch_size: usize,
    pub item_limit: Option<usize>,
    pub teardown_pause: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            job_name: config.job_name.clone(),
            query: config.retrieval.search.clone(),
            stride: config.stride(),
            rowgroup_rows: config.processing.rowgroup_rows,
            sample_interval: config.sample_interval(),
            hydration_batch_size: config.processing.hydration_batch_size,
            item_limit: config.processing.item_limit,
            teardown_pause: config.teardown_pause(),
        }
    }
}

/// What a run retrieves.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalPlan {
    Windows {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    Ids(Vec<i64>),
    Timelines(Vec<String>),
    IdRange {
        begin_ms: i64,
        end_ms: i64,
    },
}

impl RetrievalPlan {
    pub fn from_config(retrieval: &RetrievalConfig) -> Result<Self, ConfigError> {
        let missing = |field: &str| ConfigError::MissingField {
            field: format!("retrieval.{field}"),
        };
        Ok(match retrieval.mode {
            RetrievalMode::Window => RetrievalPlan::Windows {
                since: retrieval.since.ok_or_else(|| missing("since"))?,
                until: retrieval.until.ok_or_else(|| missing("until"))?,
            },
            RetrievalMode::Ids => RetrievalPlan::Ids(retrieval.resolve_ids()?),
            RetrievalMode::Timelines => RetrievalPlan::Timelines(retrieval.usernames.clone()),
            RetrievalMode::IdRange => RetrievalPlan::IdRange {
                begin_ms: retrieval.begin_ms.ok_or_else(|| missing("begin_ms"))?,
                end_ms: retrieval.end_ms.ok_or_else(|| missing("end_ms"))?,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LoopPhase {
    #[default]
    Advancing,
    Draining,
    Done,
}

/// Progress of one run. A "window" is one source call: a time window, an id
/// chunk or a timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobState {
    pub phase: LoopPhase,
    pub windows_queried: usize,
    pub windows_empty: usize,
    pub windows_failed: usize,
    pub items_fetched: usize,
    pub items_forwarded: usize,
    /// Items dropped because the graph already holds them in full.
    pub items_skipped: usize,
    /// Items dropped by normalization.
    pub items_rejected: usize,
    pub rows_flushed: usize,
    pub flushes: usize,
    /// Start of the last time window entered.
    pub cursor: Option<DateTime<Utc>>,
    pub metrics: IngestMetrics,
}

/// Pulls items from a [`Source`], normalizes them and flushes them to every
/// sink.
///
/// The loop is single-threaded and sequential: one source call at a time,
/// one accumulation buffer. Each `run_*` method consumes the loop, drains it
/// and closes every sink before returning.
pub struct RetrievalLoop<S: Source> {
    settings: LoopSettings,
    source: S,
    normalizer: SchemaNormalizer,
    accumulator: BatchAccumulator,
    coordinator: SinkCoordinator,
    dedup: Option<RehydrationDedupFilter>,
    cancel: CancellationToken,
    current_window: Option<Window>,
    state: JobState,
}

impl<S: Source> RetrievalLoop<S> {
    pub fn new(settings: LoopSettings, source: S, coordinator: SinkCoordinator) -> Self {
        let schema = FixedSchema::posts();
        let trigger = FlushTrigger::new(settings.rowgroup_rows, settings.sample_interval);
        Self {
            normalizer: SchemaNormalizer::new(schema.clone()),
            accumulator: BatchAccumulator::new(schema, trigger),
            settings,
            source,
            coordinator,
            dedup: None,
            cancel: CancellationToken::new(),
            current_window: None,
            state: JobState::default(),
        }
    }

    /// Replaces the post schema the loop normalizes into.
    pub fn with_schema(mut self, schema: FixedSchema) -> Self {
        let trigger = FlushTrigger::new(self.settings.rowgroup_rows, self.settings.sample_interval);
        self.normalizer = SchemaNormalizer::new(schema.clone());
        self.accumulator = BatchAccumulator::new(schema, trigger);
        self
    }

    pub fn with_dedup(mut self, filter: RehydrationDedupFilter) -> Self {
        self.dedup = Some(filter);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.state.metrics
    }

    pub async fn run_windows(
        self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<JobState, IngestionError> {
        self.run(RetrievalPlan::Windows { since, until }).await
    }

    pub async fn run_ids(self, ids: Vec<i64>) -> Result<JobState, IngestionError> {
        self.run(RetrievalPlan::Ids(ids)).await
    }

    pub async fn run_timelines(self, users: Vec<String>) -> Result<JobState, IngestionError> {
        self.run(RetrievalPlan::Timelines(users)).await
    }

    pub async fn run_id_range(self, begin_ms: i64, end_ms: i64) -> Result<JobState, IngestionError> {
        self.run(RetrievalPlan::IdRange { begin_ms, end_ms }).await
    }

    pub async fn run(mut self, plan: RetrievalPlan) -> Result<JobState, IngestionError> {
        info!("Starting job {} with {:?}", self.settings.job_name, plan);
        let outcome = match plan {
            RetrievalPlan::Windows { since, until } => self.drive_windows(since, until).await,
            RetrievalPlan::Ids(ids) => self.hydrate(&ids).await,
            RetrievalPlan::Timelines(users) => self.drive_timelines(&users).await,
            RetrievalPlan::IdRange { begin_ms, end_ms } => self.drive_id_range(begin_ms, end_ms).await,
        };
        self.drain(outcome).await
    }

    async fn drive_windows(&mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<(), IngestionError> {
        for window in window::windows(since, until, self.settings.stride)? {
            if self.limit_reached() {
                break;
            }
            self.check_cancelled()?;
            self.state.cursor = Some(window.since);
            self.current_window = Some(window);

            let query = self.settings.query.clone();
            let fetched = self.fetch(self.source.fetch_window(&query, &window)).await?;
            self.handle_fetch(fetched, &window.to_string(), true).await?;
        }
        Ok(())
    }

    async fn drive_timelines(&mut self, users: &[String]) -> Result<(), IngestionError> {
        for user in users {
            if self.limit_reached() {
                break;
            }
            self.check_cancelled()?;
            self.current_window = None;

            let fetched = self.fetch(self.source.fetch_timeline(user)).await?;
            self.handle_fetch(fetched, &format!("timeline of {user}"), true).await?;
        }
        Ok(())
    }

    async fn drive_id_range(&mut self, begin_ms: i64, end_ms: i64) -> Result<(), IngestionError> {
        let batch_size = self.settings.hydration_batch_size.max(1);
        let mut candidates = snowflake::ids_in_range(begin_ms, end_ms, &KNOWN_MACHINE_IDS);
        loop {
            let chunk: Vec<i64> = candidates.by_ref().take(batch_size).collect();
            if chunk.is_empty() || self.limit_reached() {
                return Ok(());
            }
            self.hydrate(&chunk).await?;
        }
    }

    /// Fetches the ids the graph does not already hold in full, in chunks.
    async fn hydrate(&mut self, ids: &[i64]) -> Result<(), IngestionError> {
        let pending = match self.dedup.as_mut() {
            Some(filter) => match filter.needs_fetch(ids).await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!("Hydration lookup failed, fetching all {} ids: {}", ids.len(), e);
                    ids.to_vec()
                }
            },
            None => ids.to_vec(),
        };
        self.state.items_skipped += ids.len().saturating_sub(pending.len());

        for chunk in pending.chunks(self.settings.hydration_batch_size.max(1)) {
            if self.limit_reached() {
                break;
            }
            self.check_cancelled()?;
            self.current_window = None;

            let fetched = self.fetch(self.source.fetch_ids(chunk)).await?;
            self.handle_fetch(fetched, &format!("{} ids", chunk.len()), false).await?;
        }
        Ok(())
    }

    /// Awaits a source call unless the run is cancelled first.
    async fn fetch(
        &self,
        call: impl Future<Output = Result<Vec<Record>, SourceError>>,
    ) -> Result<Fetched, IngestionError> {
        let started = Instant::now();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestionError::Cancelled { flushed_rows: 0 }),
            result = call => Ok(Fetched { result, elapsed: started.elapsed() }),
        }
    }

    async fn handle_fetch(&mut self, fetched: Fetched, what: &str, dedup: bool) -> Result<(), IngestionError> {
        self.state.windows_queried += 1;
        self.state.metrics.record_fetch(fetched.elapsed);
        match fetched.result.map_err(IngestionError::from) {
            Ok(records) if records.is_empty() => {
                debug!("No items for {}", what);
                self.state.windows_empty += 1;
            }
            Ok(records) => {
                debug!("Fetched {} items for {}", records.len(), what);
                self.ingest(records, dedup).await?;
            }
            Err(e) if e.should_skip_window() => {
                warn!("Skipping {}: {}", what, e);
                self.state.windows_failed += 1;
            }
            Err(e) => return Err(e),
        }
        self.maybe_flush().await
    }

    async fn ingest(&mut self, records: Vec<Record>, dedup: bool) -> Result<(), IngestionError> {
        self.state.items_fetched += records.len();

        let mut records = match self.dedup.as_mut() {
            Some(filter) if dedup => {
                let total = records.len();
                match filter.retain_unhydrated(records.clone()).await {
                    Ok((kept, dropped)) => {
                        self.state.items_skipped += dropped;
                        kept
                    }
                    Err(e) => {
                        warn!("Hydration lookup failed, forwarding all {} items: {}", total, e);
                        records
                    }
                }
            }
            _ => records,
        };

        if let Some(limit) = self.settings.item_limit {
            records.truncate(limit.saturating_sub(self.state.items_forwarded));
        }
        if records.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let normalized = self.normalizer.normalize(&records)?;
        self.state.metrics.record_normalize(records.len(), started.elapsed());

        let report = &normalized.report;
        if !report.is_clean() {
            warn!(
                "Normalization dropped {} records and {} columns, salvaged {} columns",
                report.dropped_records.len(),
                report.dropped_columns.len(),
                report.salvaged_columns.len()
            );
        }
        self.state.metrics.records_dropped += report.dropped_records.len();
        self.state.metrics.columns_salvaged += report.salvaged_columns.len();
        self.state.metrics.columns_dropped += report.dropped_columns.len();
        self.state.items_rejected += report.dropped_records.len();
        self.state.items_forwarded += records.len() - report.dropped_records.len();

        if self.coordinator.has_per_window() && normalized.batch.num_rows() > 0 {
            let ctx = FlushContext::new(&self.settings.job_name, self.current_window);
            self.coordinator.export_window(&normalized.batch, &ctx).await?;
        }
        self.accumulator.append(normalized.batch)?;
        Ok(())
    }

    async fn maybe_flush(&mut self) -> Result<(), IngestionError> {
        match self.accumulator.should_flush() {
            Some(reason) => self.flush(reason).await,
            None => Ok(()),
        }
    }

    async fn flush(&mut self, reason: FlushReason) -> Result<(), IngestionError> {
        let ctx = FlushContext::new(&self.settings.job_name, self.current_window);
        let started = Instant::now();
        let outcome = self.accumulator.flush(&mut self.coordinator, &ctx, reason).await?;
        if outcome.rows == 0 {
            return Ok(());
        }

        self.state.metrics.record_flush(outcome.rows, started.elapsed());
        self.state.flushes += 1;
        self.state.rows_flushed += outcome.rows;
        if let (Some(filter), Some(table)) = (self.dedup.as_mut(), outcome.table.as_ref()) {
            filter.mark_full(flushed_ids(table));
        }
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        let reached = self
            .settings
            .item_limit
            .is_some_and(|limit| self.state.items_forwarded >= limit);
        if reached {
            info!("Item limit reached after {} items", self.state.items_forwarded);
        }
        reached
    }

    fn check_cancelled(&self) -> Result<(), IngestionError> {
        if self.cancel.is_cancelled() {
            return Err(IngestionError::Cancelled { flushed_rows: 0 });
        }
        Ok(())
    }

    /// Flushes whatever is buffered and closes the sinks, whatever the
    /// outcome of the retrieval phase.
    async fn drain(mut self, outcome: Result<(), IngestionError>) -> Result<JobState, IngestionError> {
        self.state.phase = LoopPhase::Draining;
        if let Err(e) = &outcome {
            if e.is_cancelled() {
                info!("Job {} cancelled, draining", self.settings.job_name);
            } else {
                error!("Job {} aborting: {}", self.settings.job_name, e);
            }
        }

        let flushed = self.flush(FlushReason::Forced).await;
        let closed = self
            .coordinator
            .close_all(self.settings.teardown_pause)
            .await
            .map_err(IngestionError::from);
        self.state.phase = LoopPhase::Done;
        self.state.metrics.sink_failures = self.coordinator.failures();
        self.state.metrics.log_summary(&self.settings.job_name);

        match outcome {
            Ok(()) => {
                flushed?;
                closed?;
                info!(
                    "Job {} finished: {} windows, {} items forwarded, {} rows flushed",
                    self.settings.job_name,
                    self.state.windows_queried,
                    self.state.items_forwarded,
                    self.state.rows_flushed
                );
                Ok(self.state)
            }
            Err(e) => {
                for teardown in [flushed, closed] {
                    if let Err(te) = teardown {
                        error!("Teardown after abort failed: {}", te);
                    }
                }
                if e.is_cancelled() {
                    return Err(IngestionError::Cancelled {
                        flushed_rows: self.state.rows_flushed,
                    });
                }
                Err(e)
            }
        }
    }
}

/// Outcome of one source call and how long it took.
struct Fetched {
    result: Result<Vec<Record>, SourceError>,
    elapsed: Duration,
}

/// Non-zero ids in a flushed table.
fn flushed_ids(table: &RecordBatch) -> Vec<i64> {
    match table.column_by_name("id") {
        Some(column) => match column.as_primitive_opt::<Int64Type>() {
            Some(ids) => ids.iter().flatten().filter(|id| *id > 0).collect(),
            None => Vec::new(),
        },
        None => Vec::new(),
    }
}
