use firehose_core::config::IngestConfig;
use firehose_core::graph::{GraphBatchWriter, MemoryGraphStore};
use firehose_core::hydration::{HydrationStatus, RehydrationDedupFilter};
use firehose_core::ingestor::{LoopSettings, RetrievalLoop, RetrievalPlan};
use firehose_core::schema::FixedSchema;
use firehose_core::sink::SinkCoordinator;
use firehose_core::sink::flat_file::FlatFileSink;
use firehose_core::sink::graph::GraphSink;
use firehose_core::sink::parquet::ColumnarSink;
use firehose_core::source::JsonLinesSource;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const REPLAY: &str = r#"{"id": 1, "full_text": "Masks work https://t.co/x", "created_at": "Wed Jan 01 00:05:00 +0000 2020", "user": {"id": 11, "screen_name": "alice"}, "entities": {"user_mentions": [{"id": 12, "screen_name": "bob"}], "urls": [{"expanded_url": "https://example.org/study?id=7"}]}}
{"id": 2, "full_text": "@alice agreed", "created_at": "2020-01-01T00:12:00Z", "in_reply_to_status_id": 1, "user": {"id": 12, "screen_name": "bob"}}
this line is not json
{"id": 3, "full_text": "late", "created_at": "2020-01-01 00:25:00", "favorite_count": "4", "unknown_field": true}
"#;

fn config(dir: &Path) -> IngestConfig {
    let yaml = format!(
        r#"
job_name: replay
processing:
  stride_secs: 600
retrieval:
  mode: window
  since: 2020-01-01T00:00:00Z
  until: 2020-01-01T00:30:00Z
source:
  path: {source}
sinks:
  columnar:
    root: {columnar}
    codecs: [uncompressed, snappy]
  flat_file:
    path: {flat}
    format: csv
teardown_pause_ms: 0
"#,
        source = dir.join("replay.jsonl").display(),
        columnar = dir.join("columnar").display(),
        flat = dir.join("flat").display(),
    );
    let config = IngestConfig::from_yaml(&yaml, "test").unwrap();
    config.validate().unwrap();
    config
}

fn coordinator(config: &IngestConfig, store: Arc<MemoryGraphStore>) -> SinkCoordinator {
    let mut coordinator = SinkCoordinator::new();
    for sink in ColumnarSink::for_codecs(
        config.sinks.columnar.root.clone(),
        &config.sinks.columnar.codecs,
        FixedSchema::posts().arrow_schema(),
    ) {
        coordinator.push(Box::new(sink));
    }
    coordinator.push(Box::new(GraphSink::new(GraphBatchWriter::new(store, 2))));
    let flat_file = config.sinks.flat_file.as_ref().unwrap();
    coordinator.push(Box::new(FlatFileSink::new(flat_file.path.clone(), flat_file.format)));
    coordinator
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

fn parquet_rows(path: &Path) -> usize {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
        .unwrap()
        .build()
        .unwrap();
    reader.map(|batch| batch.unwrap().num_rows()).sum()
}

async fn run(config: &IngestConfig, store: Arc<MemoryGraphStore>) -> firehose_core::JobState {
    let source = JsonLinesSource::open(&config.source.path).await.unwrap();
    RetrievalLoop::new(LoopSettings::from_config(config), source, coordinator(config, store.clone()))
        .with_dedup(RehydrationDedupFilter::new(store, config.processing.hydration_batch_size))
        .run(RetrievalPlan::from_config(&config.retrieval).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_replay_reaches_every_sink() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("replay.jsonl"), REPLAY).unwrap();
    let config = config(dir.path());
    let store = Arc::new(MemoryGraphStore::new());

    let state = run(&config, store.clone()).await;

    assert_eq!(state.windows_queried, 3);
    assert_eq!(state.items_forwarded, 3);
    assert_eq!(state.rows_flushed, 3);

    let parquet_files = files_in(&dir.path().join("columnar").join("replay"));
    assert_eq!(parquet_files.len(), 2);
    let names: Vec<String> = parquet_files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("_b1.snappy.parquet")));
    assert!(names.iter().any(|n| n.ends_with("_b1.uncompressed.parquet")));
    for file in &parquet_files {
        assert_eq!(parquet_rows(file), 3);
    }

    let csv_files = files_in(&dir.path().join("flat").join("replay"));
    let stems: Vec<String> = csv_files
        .iter()
        .map(|p| p.file_stem().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        stems,
        vec![
            "20200101T000000_20200101T001000",
            "20200101T001000_20200101T002000",
            "20200101T002000_20200101T003000",
        ]
    );
    for (file, id) in csv_files.iter().zip(["1", "2", "3"]) {
        let csv = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(&format!(",{id},")));
    }

    let graph = store.snapshot();
    assert_eq!(graph.posts.len(), 3);
    assert!(graph.posts.values().all(|p| p.hydrated == HydrationStatus::Full));
    for edge in [
        ("Account:11", "AUTHORED", "Post:1"),
        ("Post:2", "REPLIED", "Post:1"),
        ("Post:1", "MENTIONS", "Account:12"),
        ("Post:1", "INCLUDES_URL", "Url:https://example.org/study?id=7"),
    ] {
        assert!(
            graph
                .edges
                .contains(&(edge.0.to_string(), edge.1, edge.2.to_string())),
            "missing edge {edge:?}"
        );
    }
}

#[tokio::test]
async fn test_second_replay_skips_hydrated_posts() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("replay.jsonl"), REPLAY).unwrap();
    let config = config(dir.path());
    let store = Arc::new(MemoryGraphStore::new());

    run(&config, store.clone()).await;
    let first = store.snapshot();
    let state = run(&config, store.clone()).await;

    assert_eq!(state.items_fetched, 3);
    assert_eq!(state.items_skipped, 3);
    assert_eq!(state.rows_flushed, 0);
    assert_eq!(store.snapshot(), first);
}

#[tokio::test]
async fn test_ids_mode_rehydrates_partial_posts() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("replay.jsonl"), REPLAY).unwrap();
    let mut config = config(dir.path());
    config.retrieval.mode = firehose_core::config::RetrievalMode::Ids;
    config.retrieval.ids = vec![1, 2, 99];
    config.validate().unwrap();

    let store = Arc::new(MemoryGraphStore::new());
    store.insert_post(1, HydrationStatus::Partial);
    store.insert_post(2, HydrationStatus::Full);

    let state = run(&config, store.clone()).await;

    assert_eq!(state.items_skipped, 1);
    assert_eq!(state.items_forwarded, 1);
    let graph = store.snapshot();
    assert_eq!(graph.posts[&1].hydrated, HydrationStatus::Full);
    assert!(!graph.posts.contains_key(&99));
}
