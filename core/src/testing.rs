//! Fakes shared by unit tests.

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::{SinkError, SourceError};
use crate::normalize::SchemaNormalizer;
use crate::record::Record;
use crate::schema::FixedSchema;
use crate::sink::{FlushContext, Sink};
use crate::source::{JsonLinesSource, Source};
use crate::window::Window;

/// Normalizes JSON objects against the post schema.
pub fn posts_batch(records: &[Value]) -> RecordBatch {
    let records: Vec<Record> = records
        .iter()
        .map(|r| Record::try_from(r.clone()).unwrap())
        .collect();
    SchemaNormalizer::new(FixedSchema::posts())
        .normalize(&records)
        .unwrap()
        .batch
}

/// Sink that remembers the row count of every write it receives.
pub struct RecordingSink {
    name: String,
    blocking: bool,
    per_window: bool,
    fail: bool,
    rows: Arc<Mutex<Vec<usize>>>,
    contexts: Arc<Mutex<Vec<FlushContext>>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            blocking: true,
            per_window: false,
            fail: false,
            rows: Arc::default(),
            contexts: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// Fails every write and close.
    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn per_window(mut self) -> Self {
        self.per_window = true;
        self
    }

    pub fn rows(&self) -> Arc<Mutex<Vec<usize>>> {
        self.rows.clone()
    }

    pub fn contexts(&self) -> Arc<Mutex<Vec<FlushContext>>> {
        self.contexts.clone()
    }

    pub fn closed(&self) -> Arc<Mutex<bool>> {
        self.closed.clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn per_window(&self) -> bool {
        self.per_window
    }

    async fn write(&mut self, batch: &RecordBatch, ctx: &FlushContext) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Write {
                sink: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        self.rows.lock().unwrap().push(batch.num_rows());
        self.contexts.lock().unwrap().push(ctx.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        *self.closed.lock().unwrap() = true;
        if self.fail {
            return Err(SinkError::Close {
                sink: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceCall {
    Window(Window),
    Ids(Vec<i64>),
    Timeline(String),
}

/// In-memory source with scripted failures and latency.
pub struct ScriptedSource {
    inner: JsonLinesSource,
    failing_windows: HashSet<DateTime<Utc>>,
    delay: Duration,
    stall_after: Option<usize>,
    calls: Arc<Mutex<Vec<SourceCall>>>,
}

impl ScriptedSource {
    pub fn new(records: &[Value]) -> Self {
        let records = records
            .iter()
            .map(|r| Record::try_from(r.clone()).unwrap())
            .collect();
        Self {
            inner: JsonLinesSource::from_records(records),
            failing_windows: HashSet::new(),
            delay: Duration::ZERO,
            stall_after: None,
            calls: Arc::default(),
        }
    }

    /// Windows starting at `since` fail with a transient error.
    pub fn failing_at(mut self, since: DateTime<Utc>) -> Self {
        self.failing_windows.insert(since);
        self
    }

    /// Every call takes `delay` of (tokio) time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls after the first `calls` never complete in practice.
    pub fn stalling_after(mut self, calls: usize) -> Self {
        self.stall_after = Some(calls);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<SourceCall>>> {
        self.calls.clone()
    }

    async fn enter(&self, call: SourceCall) {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call);
            calls.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.stall_after.is_some_and(|n| count > n) {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
    }
}

impl Source for ScriptedSource {
    async fn fetch_window(&self, query: &str, window: &Window) -> Result<Vec<Record>, SourceError> {
        self.enter(SourceCall::Window(*window)).await;
        if self.failing_windows.contains(&window.since) {
            return Err(SourceError::Transient {
                what: format!("window {window}"),
                reason: "rate limited".to_string(),
            });
        }
        self.inner.fetch_window(query, window).await
    }

    async fn fetch_ids(&self, ids: &[i64]) -> Result<Vec<Record>, SourceError> {
        self.enter(SourceCall::Ids(ids.to_vec())).await;
        self.inner.fetch_ids(ids).await
    }

    async fn fetch_timeline(&self, user: &str) -> Result<Vec<Record>, SourceError> {
        self.enter(SourceCall::Timeline(user.to_string())).await;
        self.inner.fetch_timeline(user).await
    }
}
