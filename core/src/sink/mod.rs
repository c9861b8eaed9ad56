pub mod flat_file;
pub mod graph;
pub mod parquet;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::errors::SinkError;
use crate::window::Window;

/// Where a flushed table came from; sinks derive file names from it.
#[derive(Debug, Clone)]
pub struct FlushContext {
    pub job_name: String,
    pub window: Option<Window>,
    pub flushed_at: DateTime<Utc>,
}

impl FlushContext {
    pub fn new(job_name: &str, window: Option<Window>) -> Self {
        Self::at(job_name, window, Utc::now())
    }

    pub fn at(job_name: &str, window: Option<Window>, flushed_at: DateTime<Utc>) -> Self {
        Self {
            job_name: job_name.to_string(),
            window,
            flushed_at,
        }
    }
}

/// The `Sink` trait defines the contract for any destination system.
/// It is responsible for taking a batch of data in Arrow format and persisting it.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Whether a failure of this sink fails the flush. Non-blocking sink
    /// errors are logged and swallowed.
    fn is_blocking(&self) -> bool {
        true
    }

    /// Whether this sink receives each window's rows as soon as they are
    /// normalized instead of the accumulated flush.
    fn per_window(&self) -> bool {
        false
    }

    async fn write(&mut self, batch: &RecordBatch, ctx: &FlushContext) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;

    /// Files this sink has produced so far.
    fn files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Fans each flushed table out to every configured sink, isolating failures.
#[derive(Default)]
pub struct SinkCoordinator {
    sinks: Vec<Box<dyn Sink>>,
    failures: usize,
}

impl SinkCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.push(sink);
        self
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        info!("Registered sink '{}'", sink.name());
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Number of sink writes or closes that failed over the coordinator's life.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Writes an accumulated flush to every sink that is not per-window. All
    /// sinks are attempted; the first blocking failure is returned afterwards.
    pub async fn write_all(&mut self, batch: &RecordBatch, ctx: &FlushContext) -> Result<(), SinkError> {
        self.write_matching(batch, ctx, false).await
    }

    /// Writes one window's normalized rows to the per-window sinks.
    pub async fn export_window(&mut self, batch: &RecordBatch, ctx: &FlushContext) -> Result<(), SinkError> {
        self.write_matching(batch, ctx, true).await
    }

    pub fn has_per_window(&self) -> bool {
        self.sinks.iter().any(|s| s.per_window())
    }

    async fn write_matching(
        &mut self,
        batch: &RecordBatch,
        ctx: &FlushContext,
        per_window: bool,
    ) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut().filter(|s| s.per_window() == per_window) {
            match sink.write(batch, ctx).await {
                Ok(()) => debug!("Sink '{}' wrote {} rows", sink.name(), batch.num_rows()),
                Err(e) if sink.is_blocking() => {
                    error!("Sink '{}' failed: {}", sink.name(), e);
                    self.failures += 1;
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!("Non-blocking sink '{}' failed, continuing: {}", sink.name(), e);
                    self.failures += 1;
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes every sink in registration order, pausing between closes.
    /// Closing continues past failures; the first one is returned.
    pub async fn close_all(&mut self, pause: Duration) -> Result<(), SinkError> {
        let mut first_error = None;
        for (i, sink) in self.sinks.iter_mut().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            match sink.close().await {
                Ok(()) => info!("Closed sink '{}'", sink.name()),
                Err(e) => {
                    error!("Failed to close sink '{}': {}", sink.name(), e);
                    self.failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Every file produced by any sink.
    pub fn files(&self) -> Vec<PathBuf> {
        self.sinks.iter().flat_map(|s| s.files()).collect()
    }
}

/// Restricts a job name to `[A-Za-z0-9_-]` so it is safe as a directory name.
pub fn sanitize_job_name(job_name: &str) -> String {
    job_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, posts_batch};
    use serde_json::json;

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let failing = RecordingSink::failing("graph");
        let healthy = RecordingSink::new("parquet:snappy");
        let healthy_rows = healthy.rows();
        let mut coordinator = SinkCoordinator::new()
            .with_sink(Box::new(failing))
            .with_sink(Box::new(healthy));

        let batch = posts_batch(&[json!({"id": 1}), json!({"id": 2})]);
        let ctx = FlushContext::new("job", None);
        let err = coordinator.write_all(&batch, &ctx).await.unwrap_err();

        assert!(matches!(err, SinkError::Write { ref sink, .. } if sink == "graph"));
        assert_eq!(*healthy_rows.lock().unwrap(), vec![2]);
        assert_eq!(coordinator.failures(), 1);
    }

    #[tokio::test]
    async fn test_non_blocking_failure_is_swallowed() {
        let mut coordinator = SinkCoordinator::new()
            .with_sink(Box::new(RecordingSink::failing("flat_file").non_blocking()))
            .with_sink(Box::new(RecordingSink::new("parquet:uncompressed")));

        let batch = posts_batch(&[json!({"id": 1})]);
        coordinator
            .write_all(&batch, &FlushContext::new("job", None))
            .await
            .unwrap();
        assert_eq!(coordinator.failures(), 1);
    }

    #[tokio::test]
    async fn test_per_window_sinks_only_see_window_exports() {
        let flushed = RecordingSink::new("parquet:snappy");
        let flushed_rows = flushed.rows();
        let exported = RecordingSink::new("flat_file:csv").per_window();
        let exported_rows = exported.rows();
        let mut coordinator = SinkCoordinator::new()
            .with_sink(Box::new(flushed))
            .with_sink(Box::new(exported));
        assert!(coordinator.has_per_window());

        let ctx = FlushContext::new("job", None);
        coordinator
            .export_window(&posts_batch(&[json!({"id": 1})]), &ctx)
            .await
            .unwrap();
        coordinator
            .write_all(&posts_batch(&[json!({"id": 1}), json!({"id": 2})]), &ctx)
            .await
            .unwrap();

        assert_eq!(*flushed_rows.lock().unwrap(), vec![2]);
        assert_eq!(*exported_rows.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_continues_after_failure() {
        let first = RecordingSink::failing("graph");
        let second = RecordingSink::new("parquet:snappy");
        let closed = second.closed();
        let mut coordinator = SinkCoordinator::new()
            .with_sink(Box::new(first))
            .with_sink(Box::new(second));

        let started = tokio::time::Instant::now();
        let err = coordinator.close_all(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, SinkError::Close { .. }));
        assert!(*closed.lock().unwrap());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_sanitize_job_name() {
        assert_eq!(sanitize_job_name("covid 19/ü"), "covid_19__");
        assert_eq!(sanitize_job_name("ok_name-1"), "ok_name-1");
    }
}
