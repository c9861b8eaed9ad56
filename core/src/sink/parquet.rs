//! Parquet file writer.
//!
//! One sink per compression codec. Each sink keeps a single open file per
//! hour bucket and rotates when a flush lands in a new hour. Sinks built
//! together share a run index so every codec's file for one bucket carries
//! the same `b<run>` number.

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{FlushContext, Sink, sanitize_job_name};
use crate::config::Codec;
use crate::errors::SinkError;

const EPOCH_FORMAT: &str = "%Y_%m_%d_%H";

/// Allocates `b<run>` indices for (directory, hour bucket) pairs. The first
/// sink to open a bucket picks the lowest run with no file for any codec.
#[derive(Debug, Clone)]
pub struct RunIndex {
    codecs: Vec<Codec>,
    runs: Arc<Mutex<HashMap<(PathBuf, String), u32>>>,
}

impl RunIndex {
    pub fn new(codecs: &[Codec]) -> Self {
        Self {
            codecs: codecs.to_vec(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn resolve(&self, dir: &Path, epoch: &str) -> u32 {
        let mut runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *runs
            .entry((dir.to_path_buf(), epoch.to_string()))
            .or_insert_with(|| {
                let mut run = 1;
                while self
                    .codecs
                    .iter()
                    .any(|codec| file_path(dir, epoch, run, *codec).exists())
                {
                    run += 1;
                }
                run
            })
    }
}

fn file_path(dir: &Path, epoch: &str, run: u32, codec: Codec) -> PathBuf {
    dir.join(format!("{epoch}_b{run}.{}.parquet", codec.suffix()))
}

struct OpenFile {
    epoch: String,
    path: PathBuf,
    writer: ArrowWriter<File>,
    rows: usize,
}

pub struct ColumnarSink {
    name: String,
    root: PathBuf,
    codec: Codec,
    schema: SchemaRef,
    runs: RunIndex,
    current: Option<OpenFile>,
    files: Vec<PathBuf>,
}

impl ColumnarSink {
    pub fn new(root: impl Into<PathBuf>, codec: Codec, schema: SchemaRef, runs: RunIndex) -> Self {
        Self {
            name: format!("parquet:{codec}"),
            root: root.into(),
            codec,
            schema,
            runs,
            current: None,
            files: Vec::new(),
        }
    }

    /// One sink per codec, sharing a run index.
    pub fn for_codecs(root: impl Into<PathBuf>, codecs: &[Codec], schema: SchemaRef) -> Vec<Self> {
        let root = root.into();
        let runs = RunIndex::new(codecs);
        codecs
            .iter()
            .map(|codec| Self::new(root.clone(), *codec, schema.clone(), runs.clone()))
            .collect()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Path of the file currently open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }

    fn writer_properties(codec: Codec) -> WriterProperties {
        let compression = match codec {
            Codec::Uncompressed => Compression::UNCOMPRESSED,
            Codec::Snappy => Compression::SNAPPY,
            Codec::Gzip => Compression::GZIP(GzipLevel::default()),
            Codec::Zstd => Compression::ZSTD(ZstdLevel::default()),
            Codec::Lz4 => Compression::LZ4,
        };
        WriterProperties::builder().set_compression(compression).build()
    }

    fn open(&mut self, job_name: &str, epoch: &str) -> Result<(), SinkError> {
        let dir = self.root.join(sanitize_job_name(job_name));
        std::fs::create_dir_all(&dir).map_err(|e| self.open_error(&dir, e))?;

        let run = self.runs.resolve(&dir, epoch);
        let path = file_path(&dir, epoch, run, self.codec);
        let file = File::create(&path).map_err(|e| self.open_error(&path, e))?;
        let writer = ArrowWriter::try_new(
            file,
            self.schema.clone(),
            Some(Self::writer_properties(self.codec)),
        )
        .map_err(|e| self.open_error(&path, e))?;

        info!("Opened parquet file {}", path.display());
        self.files.push(path.clone());
        self.current = Some(OpenFile {
            epoch: epoch.to_string(),
            path,
            writer,
            rows: 0,
        });
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), SinkError> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        open.writer.close().map_err(|e| SinkError::Close {
            sink: self.name.clone(),
            reason: format!("{}: {e}", open.path.display()),
        })?;
        info!(
            "Closed parquet file {} ({} rows)",
            open.path.display(),
            open.rows
        );
        Ok(())
    }

    fn open_error(&self, path: &Path, e: impl std::fmt::Display) -> SinkError {
        SinkError::Open {
            sink: self.name.clone(),
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Sink for ColumnarSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, batch: &RecordBatch, ctx: &FlushContext) -> Result<(), SinkError> {
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let epoch = ctx.flushed_at.format(EPOCH_FORMAT).to_string();
        if self.current.as_ref().is_some_and(|f| f.epoch != epoch) {
            debug!("Hour bucket rolled over to {}, rotating {}", epoch, self.name);
            self.close_current()?;
        }
        if self.current.is_none() {
            self.open(&ctx.job_name, &epoch)?;
        }

        let name = self.name.clone();
        let write_error = |e: parquet::errors::ParquetError| SinkError::Write {
            sink: name.clone(),
            reason: e.to_string(),
        };
        if let Some(open) = self.current.as_mut() {
            open.writer.write(batch).map_err(write_error)?;
            // one row group per flush
            open.writer.flush().map_err(write_error)?;
            open.rows += batch.num_rows();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.close_current()
    }

    fn files(&self) -> Vec<PathBuf> {
        self.files.clone()
    }
}
