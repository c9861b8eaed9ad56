use serde::Serialize;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "firehose_core=info,firehose_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Throughput counters for one pipeline instance.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct IngestMetrics {
    pub fetches: usize,
    pub records_normalized: usize,
    pub records_dropped: usize,
    pub columns_salvaged: usize,
    pub columns_dropped: usize,
    pub flushes: usize,
    pub rows_flushed: usize,
    pub sink_failures: usize,
    pub fetch_seconds: f64,
    pub normalize_seconds: f64,
    pub flush_seconds: f64,
}

impl IngestMetrics {
    pub fn record_fetch(&mut self, elapsed: Duration) {
        self.fetches += 1;
        self.fetch_seconds += elapsed.as_secs_f64();
    }

    pub fn record_normalize(&mut self, rows: usize, elapsed: Duration) {
        self.records_normalized += rows;
        self.normalize_seconds += elapsed.as_secs_f64();
    }

    pub fn record_flush(&mut self, rows: usize, elapsed: Duration) {
        self.flushes += 1;
        self.rows_flushed += rows;
        self.flush_seconds += elapsed.as_secs_f64();
    }

    /// Rows per second spent in flushes, or zero before the first flush.
    pub fn flush_throughput(&self) -> f64 {
        if self.flush_seconds > 0.0 {
            self.rows_flushed as f64 / self.flush_seconds
        } else {
            0.0
        }
    }

    pub fn log_summary(&self, job_name: &str) {
        info!(
            job = job_name,
            fetches = self.fetches,
            normalized = self.records_normalized,
            dropped = self.records_dropped,
            flushes = self.flushes,
            rows_flushed = self.rows_flushed,
            sink_failures = self.sink_failures,
            "Pipeline metrics: {:.1} rows/s flushed, fetch {:.2}s, normalize {:.2}s",
            self.flush_throughput(),
            self.fetch_seconds,
            self.normalize_seconds
        );
    }
}
