use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::ConfigError;

pub const CONFIG_ENV_VAR: &str = "FIREHOSE_CONFIG";

/// Longest accepted window stride: one leap year.
pub const MAX_STRIDE_SECS: u64 = 366 * 24 * 3600;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub job_name: String,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub retrieval: RetrievalConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub sinks: SinksConfig,
    #[serde(default = "default_teardown_pause_ms")]
    pub teardown_pause_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    /// Flush once more than this many rows are buffered.
    #[serde(default = "default_rowgroup_rows")]
    pub rowgroup_rows: usize,
    /// Flush once this long has passed since the last flush.
    #[serde(default)]
    pub sample_interval_secs: Option<u64>,
    #[serde(default = "default_hydration_batch_size")]
    pub hydration_batch_size: usize,
    #[serde(default = "default_stride_secs")]
    pub stride_secs: u64,
    /// Stop retrieving once this many items were forwarded.
    #[serde(default)]
    pub item_limit: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            rowgroup_rows: default_rowgroup_rows(),
            sample_interval_secs: None,
            hydration_batch_size: default_hydration_batch_size(),
            stride_secs: default_stride_secs(),
            item_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Window,
    Ids,
    Timelines,
    IdRange,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ids: Vec<i64>,
    /// Headerless CSV whose first column holds more ids to hydrate.
    #[serde(default)]
    pub ids_path: Option<PathBuf>,
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(default)]
    pub begin_ms: Option<i64>,
    #[serde(default)]
    pub end_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Newline-delimited JSON file, or a directory of them.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SinksConfig {
    #[serde(default)]
    pub columnar: ColumnarConfig,
    #[serde(default)]
    pub graph: Option<GraphConfig>,
    #[serde(default)]
    pub flat_file: Option<FlatFileConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnarConfig {
    #[serde(default = "default_columnar_root")]
    pub root: PathBuf,
    #[serde(default = "default_codecs")]
    pub codecs: Vec<Codec>,
}

impl Default for ColumnarConfig {
    fn default() -> Self {
        Self {
            root: default_columnar_root(),
            codecs: default_codecs(),
        }
    }
}

/// Parquet compression codec; each configured codec gets its own file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Uncompressed,
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

impl Codec {
    /// File name infix, as in `<epoch>_b<run>.<suffix>.parquet`.
    pub fn suffix(self) -> &'static str {
        match self {
            Codec::Uncompressed => "uncompressed",
            Codec::Snappy => "snappy",
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlatFileConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: FlatFileFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlatFileFormat {
    #[default]
    Csv,
    Json,
}

impl FlatFileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FlatFileFormat::Csv => "csv",
            FlatFileFormat::Json => "jsonl",
        }
    }
}

fn default_rowgroup_rows() -> usize {
    5000
}

fn default_hydration_batch_size() -> usize {
    100
}

fn default_stride_secs() -> u64 {
    600
}

fn default_teardown_pause_ms() -> u64 {
    1000
}

fn default_columnar_root() -> PathBuf {
    PathBuf::from("firehose_data")
}

fn default_codecs() -> Vec<Codec> {
    vec![Codec::Uncompressed, Codec::Snappy]
}

fn default_chunk_size() -> usize {
    1000
}

fn default_statement_timeout_secs() -> u64 {
    30
}

pub fn load_config(config_path: Option<&str>) -> Result<IngestConfig, ConfigError> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.display().to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content, &path.display().to_string())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let content = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: format!("{CONFIG_ENV_VAR} environment variable"),
        })?;
        Self::from_yaml(&content, CONFIG_ENV_VAR)
    }

    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            origin: origin.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "job_name".to_string(),
            });
        }

        let processing = &self.processing;
        if processing.rowgroup_rows == 0 {
            return Err(invalid("processing.rowgroup_rows must be positive"));
        }
        if processing.hydration_batch_size == 0 {
            return Err(invalid("processing.hydration_batch_size must be positive"));
        }
        if processing.stride_secs == 0 {
            return Err(invalid("processing.stride_secs must be positive"));
        }
        if processing.stride_secs > MAX_STRIDE_SECS {
            return Err(invalid("processing.stride_secs cannot exceed one year"));
        }
        if processing.sample_interval_secs == Some(0) {
            return Err(invalid("processing.sample_interval_secs must be positive"));
        }

        let retrieval = &self.retrieval;
        match retrieval.mode {
            RetrievalMode::Window => match (retrieval.since, retrieval.until) {
                (Some(since), Some(until)) if since < until => {}
                (Some(_), Some(_)) => return Err(invalid("retrieval.since must be before retrieval.until")),
                (None, _) => {
                    return Err(ConfigError::MissingField {
                        field: "retrieval.since".to_string(),
                    });
                }
                (_, None) => {
                    return Err(ConfigError::MissingField {
                        field: "retrieval.until".to_string(),
                    });
                }
            },
            RetrievalMode::Ids if retrieval.ids.is_empty() && retrieval.ids_path.is_none() => {
                return Err(ConfigError::MissingField {
                    field: "retrieval.ids".to_string(),
                });
            }
            RetrievalMode::Timelines if retrieval.usernames.is_empty() => {
                return Err(ConfigError::MissingField {
                    field: "retrieval.usernames".to_string(),
                });
            }
            RetrievalMode::IdRange => match (retrieval.begin_ms, retrieval.end_ms) {
                (Some(begin), Some(end)) if begin < end => {}
                (Some(_), Some(_)) => return Err(invalid("retrieval.begin_ms must be before retrieval.end_ms")),
                _ => {
                    return Err(ConfigError::MissingField {
                        field: "retrieval.begin_ms/end_ms".to_string(),
                    });
                }
            },
            _ => {}
        }

        let columnar = &self.sinks.columnar;
        if columnar.codecs.is_empty() {
            return Err(invalid("sinks.columnar.codecs cannot be empty"));
        }
        let unique: HashSet<Codec> = columnar.codecs.iter().copied().collect();
        if unique.len() != columnar.codecs.len() {
            return Err(invalid("sinks.columnar.codecs contains duplicates"));
        }

        if let Some(graph) = &self.sinks.graph {
            if graph.uri.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: "sinks.graph.uri".to_string(),
                });
            }
            if graph.chunk_size == 0 {
                return Err(invalid("sinks.graph.chunk_size must be positive"));
            }
            if graph.statement_timeout_secs == 0 {
                return Err(invalid("sinks.graph.statement_timeout_secs must be positive"));
            }
        }

        Ok(())
    }

    pub fn stride(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.processing.stride_secs.min(MAX_STRIDE_SECS) as i64)
    }

    pub fn sample_interval(&self) -> Option<Duration> {
        self.processing.sample_interval_secs.map(Duration::from_secs)
    }

    pub fn teardown_pause(&self) -> Duration {
        Duration::from_millis(self.teardown_pause_ms)
    }
}

impl RetrievalConfig {
    /// The configured `ids` followed by any read from `ids_path`.
    pub fn resolve_ids(&self) -> Result<Vec<i64>, ConfigError> {
        let mut ids = self.ids.clone();
        if let Some(path) = &self.ids_path {
            ids.extend(read_id_file(path)?);
        }
        Ok(ids)
    }
}

/// Reads post ids from the first column of a headerless CSV file. Blank lines
/// are ignored; lines without an integer id are skipped with a warning.
pub fn read_id_file(path: &Path) -> Result<Vec<i64>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
        origin: path.display().to_string(),
        error: Box::new(e),
    })?;

    let mut ids = Vec::new();
    let mut skipped = 0usize;
    for line in content.lines() {
        let first = line.split(',').next().unwrap_or_default().trim().trim_matches('"');
        if first.is_empty() {
            continue;
        }
        match first.parse::<i64>() {
            Ok(id) => ids.push(id),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Skipped {} lines without an id in {}", skipped, path.display());
    }
    info!("Loaded {} ids from {}", ids.len(), path.display());
    Ok(ids)
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FULL_CONFIG: &str = r#"
job_name: covid-19
processing:
  rowgroup_rows: 2000
  sample_interval_secs: 30
  stride_secs: 300
  item_limit: 10000
retrieval:
  mode: window
  search: covid
  since: 2020-03-01T00:00:00Z
  until: 2020-03-02T00:00:00Z
source:
  path: /data/replay
sinks:
  columnar:
    root: /data/firehose
    codecs: [uncompressed, snappy, zstd]
  graph:
    uri: bolt://localhost:7687
    user: neo4j
    password: secret
    chunk_size: 500
  flat_file:
    path: /output
    format: json
teardown_pause_ms: 250
"#;

    #[test]
    fn test_parse_full_config() {
        let config = IngestConfig::from_yaml(FULL_CONFIG, "test").unwrap();
        config.validate().unwrap();

        assert_eq!(config.job_name, "covid-19");
        assert_eq!(config.processing.rowgroup_rows, 2000);
        assert_eq!(config.processing.hydration_batch_size, 100);
        assert_eq!(config.sample_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.stride(), chrono::Duration::minutes(5));
        assert_eq!(config.retrieval.mode, RetrievalMode::Window);
        assert_eq!(
            config.retrieval.since,
            Some(Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            config.sinks.columnar.codecs,
            vec![Codec::Uncompressed, Codec::Snappy, Codec::Zstd]
        );
        let graph = config.sinks.graph.as_ref().unwrap();
        assert_eq!(graph.chunk_size, 500);
        assert_eq!(graph.statement_timeout_secs, 30);
        assert_eq!(
            config.sinks.flat_file.as_ref().unwrap().format,
            FlatFileFormat::Json
        );
        assert_eq!(config.teardown_pause(), Duration::from_millis(250));
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
job_name: ids
retrieval:
  mode: ids
  ids: [1, 2, 3]
source:
  path: replay.jsonl
"#;
        let config = IngestConfig::from_yaml(yaml, "test").unwrap();
        config.validate().unwrap();

        assert_eq!(config.processing.rowgroup_rows, 5000);
        assert_eq!(config.processing.stride_secs, 600);
        assert_eq!(config.sample_interval(), None);
        assert_eq!(config.sinks.columnar.root, PathBuf::from("firehose_data"));
        assert_eq!(
            config.sinks.columnar.codecs,
            vec![Codec::Uncompressed, Codec::Snappy]
        );
        assert!(config.sinks.graph.is_none());
        assert_eq!(config.teardown_pause_ms, 1000);
    }

    #[test]
    fn test_validation_failures() {
        let base = IngestConfig::from_yaml(FULL_CONFIG, "test").unwrap();

        let mut config = base.clone();
        config.job_name = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField { .. })));

        let mut config = base.clone();
        config.retrieval.until = config.retrieval.since;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed { .. })));

        let mut config = base.clone();
        config.sinks.columnar.codecs = vec![Codec::Snappy, Codec::Snappy];
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed { .. })));

        let mut config = base.clone();
        config.retrieval.mode = RetrievalMode::Timelines;
        assert!(matches!(config.validate(), Err(ConfigError::MissingField { .. })));

        let mut config = base;
        config.retrieval.mode = RetrievalMode::IdRange;
        config.retrieval.begin_ms = Some(10);
        config.retrieval.end_ms = Some(5);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed { .. })));
    }

    #[test]
    fn test_stride_is_bounded() {
        let mut config = IngestConfig::from_yaml(FULL_CONFIG, "test").unwrap();
        config.processing.stride_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed { .. })));
        assert_eq!(config.stride(), chrono::Duration::days(366));

        config.processing.stride_secs = MAX_STRIDE_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_ids_read_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "101\n 102 ,extra\n\nid\n\"103\"\n").unwrap();
        let yaml = format!(
            r#"
job_name: rehydrate
retrieval:
  mode: ids
  ids: [7]
  ids_path: {}
source:
  path: replay.jsonl
"#,
            path.display()
        );

        let config = IngestConfig::from_yaml(&yaml, "test").unwrap();
        config.validate().unwrap();
        assert_eq!(config.retrieval.resolve_ids().unwrap(), vec![7, 101, 102, 103]);

        let mut config = config;
        config.retrieval.ids.clear();
        config.validate().unwrap();

        config.retrieval.ids_path = Some(dir.path().join("missing.csv"));
        assert!(matches!(
            config.retrieval.resolve_ids(),
            Err(ConfigError::LoadFailed { .. })
        ));
    }

    #[test]
    fn test_unreadable_file_reports_source() {
        let err = IngestConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }

    #[test]
    fn test_codec_suffixes() {
        assert_eq!(Codec::Uncompressed.to_string(), "uncompressed");
        assert_eq!(FlatFileFormat::Json.extension(), "jsonl");
    }
}
