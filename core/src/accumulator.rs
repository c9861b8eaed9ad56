use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::{IngestionError, SchemaMismatchError};
use crate::schema::FixedSchema;
use crate::sink::{FlushContext, SinkCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    RowThreshold,
    SampleInterval,
    Forced,
}

/// Decides when buffered rows must be flushed: more than `rowgroup_rows`
/// rows since the last flush, or `sample_interval` elapsed since it.
#[derive(Debug, Clone)]
pub struct FlushTrigger {
    rowgroup_rows: usize,
    sample_interval: Option<Duration>,
    rows_since_flush: usize,
    last_flush: Instant,
}

impl FlushTrigger {
    pub fn new(rowgroup_rows: usize, sample_interval: Option<Duration>) -> Self {
        Self {
            rowgroup_rows,
            sample_interval,
            rows_since_flush: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn record_rows(&mut self, rows: usize) {
        self.rows_since_flush += rows;
    }

    pub fn check(&self) -> Option<FlushReason> {
        if self.rows_since_flush > self.rowgroup_rows {
            return Some(FlushReason::RowThreshold);
        }
        match self.sample_interval {
            Some(interval) if self.last_flush.elapsed() >= interval => Some(FlushReason::SampleInterval),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.rows_since_flush = 0;
        self.last_flush = Instant::now();
    }

    pub fn rows_since_flush(&self) -> usize {
        self.rows_since_flush
    }
}

/// Result of one flush: how many rows went out, and the table itself.
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    pub rows: usize,
    pub table: Option<RecordBatch>,
}

/// Buffers normalized batches between flushes. Single writer; state is
/// cleared on every flush whatever the sinks report.
pub struct BatchAccumulator {
    schema: FixedSchema,
    batches: Vec<RecordBatch>,
    rows: usize,
    trigger: FlushTrigger,
}

impl BatchAccumulator {
    pub fn new(schema: FixedSchema, trigger: FlushTrigger) -> Self {
        Self {
            schema,
            batches: Vec::new(),
            rows: 0,
            trigger,
        }
    }

    pub fn append(&mut self, batch: RecordBatch) -> Result<(), SchemaMismatchError> {
        self.schema.verify(batch.schema().as_ref())?;
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.rows += batch.num_rows();
        self.trigger.record_rows(batch.num_rows());
        self.batches.push(batch);
        debug!("Accumulated {} rows in {} batches", self.rows, self.batches.len());
        Ok(())
    }

    pub fn should_flush(&self) -> Option<FlushReason> {
        self.trigger.check()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Concatenates the buffer into one table and hands it to every sink.
    pub async fn flush(
        &mut self,
        coordinator: &mut SinkCoordinator,
        ctx: &FlushContext,
        reason: FlushReason,
    ) -> Result<FlushOutcome, IngestionError> {
        let batches = std::mem::take(&mut self.batches);
        let rows = std::mem::take(&mut self.rows);
        self.trigger.reset();

        if rows == 0 {
            debug!("Nothing to flush ({:?})", reason);
            return Ok(FlushOutcome::default());
        }

        let table = concat_batches(&self.schema.arrow_schema(), &batches)?;
        info!("Flushing {} rows ({:?}) for job {}", rows, reason, ctx.job_name);
        coordinator.write_all(&table, ctx).await?;

        Ok(FlushOutcome {
            rows,
            table: Some(table),
        })
    }
}
