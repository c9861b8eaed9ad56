use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use firehose_core::config::{IngestConfig, load_config};
use firehose_core::graph::{GraphBatchWriter, Neo4jGraphStore};
use firehose_core::hydration::RehydrationDedupFilter;
use firehose_core::ingestor::{LoopSettings, RetrievalLoop, RetrievalPlan};
use firehose_core::schema::FixedSchema;
use firehose_core::sink::SinkCoordinator;
use firehose_core::sink::flat_file::FlatFileSink;
use firehose_core::sink::graph::GraphSink;
use firehose_core::sink::parquet::ColumnarSink;
use firehose_core::source::JsonLinesSource;
use firehose_core::telemetry::init_tracing;

/// Runs one retrieval job to completion.
///
/// The configuration is read from the YAML file given as the first argument,
/// or from the `FIREHOSE_CONFIG` environment variable. Ctrl-C cancels the run;
/// buffered rows are still flushed before exiting.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;
    let plan = RetrievalPlan::from_config(&config.retrieval)?;
    info!("Loaded configuration for job {}", config.job_name);

    let (coordinator, dedup) = build_sinks(&config).await?;
    let source = JsonLinesSource::open(&config.source.path)
        .await
        .with_context(|| format!("Failed to open source {}", config.source.path.display()))?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, draining");
            signal.cancel();
        }
    });

    let mut pipeline =
        RetrievalLoop::new(LoopSettings::from_config(&config), source, coordinator).with_cancellation(cancel);
    if let Some(filter) = dedup {
        pipeline = pipeline.with_dedup(filter);
    }

    match pipeline.run(plan).await {
        Ok(state) => {
            info!("Job {} completed: {:?}", config.job_name, state);
            Ok(())
        }
        Err(e) => {
            error!("Job {} failed: {}", config.job_name, e);
            Err(e.into())
        }
    }
}

async fn build_sinks(config: &IngestConfig) -> Result<(SinkCoordinator, Option<RehydrationDedupFilter>)> {
    let mut coordinator = SinkCoordinator::new();
    let columnar = &config.sinks.columnar;
    for sink in ColumnarSink::for_codecs(
        columnar.root.clone(),
        &columnar.codecs,
        FixedSchema::posts().arrow_schema(),
    ) {
        coordinator.push(Box::new(sink));
    }

    let mut dedup = None;
    if let Some(graph) = &config.sinks.graph {
        let store = Arc::new(Neo4jGraphStore::connect(graph).await?);
        coordinator.push(Box::new(GraphSink::new(GraphBatchWriter::new(
            store.clone(),
            graph.chunk_size,
        ))));
        dedup = Some(RehydrationDedupFilter::new(
            store,
            config.processing.hydration_batch_size,
        ));
    }

    if let Some(flat_file) = &config.sinks.flat_file {
        coordinator.push(Box::new(FlatFileSink::new(flat_file.path.clone(), flat_file.format)));
    }

    Ok((coordinator, dedup))
}
