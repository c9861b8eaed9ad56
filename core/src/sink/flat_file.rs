use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::debug;

use super::{FlushContext, Sink, sanitize_job_name};
use crate::config::FlatFileFormat;
use crate::errors::SinkError;

/// Best-effort export of each window's rows to CSV or JSON lines, one file
/// per (job, window). Failures never fail a run.
pub struct FlatFileSink {
    name: String,
    root: PathBuf,
    format: FlatFileFormat,
    files: Vec<PathBuf>,
}

impl FlatFileSink {
    pub fn new(root: impl Into<PathBuf>, format: FlatFileFormat) -> Self {
        Self {
            name: format!("flat_file:{}", format.extension()),
            root: root.into(),
            format,
            files: Vec::new(),
        }
    }

    fn target(&self, ctx: &FlushContext) -> PathBuf {
        let stem = match &ctx.window {
            Some(window) => window.file_stem(),
            None => ctx.flushed_at.format("%Y%m%dT%H%M%S%3f").to_string(),
        };
        self.root
            .join(sanitize_job_name(&ctx.job_name))
            .join(format!("{stem}.{}", self.format.extension()))
    }

    fn write_error(&self, e: impl std::fmt::Display) -> SinkError {
        SinkError::Write {
            sink: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Sink for FlatFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn per_window(&self) -> bool {
        true
    }

    async fn write(&mut self, batch: &RecordBatch, ctx: &FlushContext) -> Result<(), SinkError> {
        let path = self.target(ctx);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| SinkError::Open {
                sink: self.name.clone(),
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        // A window flushed more than once appends to the same file.
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SinkError::Open {
                sink: self.name.clone(),
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        match self.format {
            FlatFileFormat::Csv => {
                let mut writer = arrow::csv::WriterBuilder::new()
                    .with_header(is_new)
                    .build(file);
                writer.write(batch).map_err(|e| self.write_error(e))?;
            }
            FlatFileFormat::Json => {
                let mut writer = arrow::json::LineDelimitedWriter::new(file);
                writer.write(batch).map_err(|e| self.write_error(e))?;
                writer.finish().map_err(|e| self.write_error(e))?;
            }
        }

        debug!("Exported {} rows to {}", batch.num_rows(), path.display());
        if is_new {
            self.files.push(path);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn files(&self) -> Vec<PathBuf> {
        self.files.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::posts_batch;
    use crate::window::Window;
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn window_ctx() -> FlushContext {
        let window = Window::new(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 10, 0).unwrap(),
        )
        .unwrap();
        FlushContext::new("covid", Some(window))
    }

    #[tokio::test]
    async fn test_csv_export_per_window() {
        let dir = TempDir::new().unwrap();
        let mut sink = FlatFileSink::new(dir.path(), FlatFileFormat::Csv);
        let batch = posts_batch(&[
            json!({"id": 1, "full_text": "first", "created_at": "2020-01-01T00:01:00Z"}),
            json!({"id": 2, "full_text": "second", "created_at": "2020-01-01T00:02:00Z"}),
        ]);

        sink.write(&batch, &window_ctx()).await.unwrap();
        sink.write(&batch, &window_ctx()).await.unwrap();

        let path = dir
            .path()
            .join("covid")
            .join("20200101T000000_20200101T001000.csv");
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("contributors,coordinates,created_at"));
        assert_eq!(lines.iter().filter(|l| l.contains("first")).count(), 2);
        assert!(lines[1].contains("2020-01-01T00:01:00"));
        assert_eq!(sink.files(), vec![path]);
    }

    #[tokio::test]
    async fn test_json_lines_export() {
        let dir = TempDir::new().unwrap();
        let mut sink = FlatFileSink::new(dir.path(), FlatFileFormat::Json);
        let batch = posts_batch(&[
            json!({"id": 5, "lang": "en", "created_at": "2020-01-01T00:03:00Z"}),
            json!({"id": 6}),
        ]);

        sink.write(&batch, &window_ctx()).await.unwrap();

        let content = std::fs::read_to_string(&sink.files()[0]).unwrap();
        let rows: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 5);
        assert_eq!(rows[0]["lang"], "en");
        assert!(rows[0]["created_at"].as_str().unwrap().starts_with("2020-01-01T00:03:00"));
        assert!(!sink.is_blocking());
        assert!(sink.per_window());
    }

    #[tokio::test]
    async fn test_unwritable_root_reports_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut sink = FlatFileSink::new(&blocker, FlatFileFormat::Csv);

        let result = sink.write(&posts_batch(&[json!({"id": 1})]), &window_ctx()).await;
        assert!(matches!(result, Err(SinkError::Open { .. })));
    }
}
