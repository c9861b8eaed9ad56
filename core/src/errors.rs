use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Schema coercion failed: {0}")]
    SchemaCoercion(#[from] SchemaCoercionError),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaMismatchError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Graph store error: {0}")]
    Graph(#[from] GraphError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Run cancelled after draining {flushed_rows} rows")]
    Cancelled { flushed_rows: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("A transient error occurred while fetching {what}: {reason}")]
    Transient { what: String, reason: String },

    #[error("Source input is unreadable: {0}")]
    Unreadable(#[source] std::io::Error),
}

/// Raised when a raw batch cannot be reconciled with the fixed schema at all.
#[derive(Error, Debug)]
pub enum SchemaCoercionError {
    #[error("No column survived coercion ({dropped} raw columns dropped across {rows} rows)")]
    NoSurvivingColumns { rows: usize, dropped: usize },

    #[error("Failed to assemble record batch: {reason}")]
    Assembly { reason: String },
}

#[derive(Error, Debug)]
pub enum SchemaMismatchError {
    #[error("Column count mismatch: expected {expected}, got {actual}")]
    ColumnCount { expected: usize, actual: usize },

    #[error("Column #{index} mismatch: expected {expected}, got {actual}")]
    Column {
        index: usize,
        expected: String,
        actual: String,
    },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink '{sink}' failed to write batch: {reason}")]
    Write { sink: String, reason: String },

    #[error("Sink '{sink}' failed to open {path}: {reason}")]
    Open {
        sink: String,
        path: String,
        reason: String,
    },

    #[error("Sink '{sink}' failed to close: {reason}")]
    Close { sink: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Failed to connect to graph store at {uri}: {reason}")]
    Connection { uri: String, reason: String },

    #[error("Graph statement failed: {reason}")]
    Statement { reason: String },

    #[error("Graph statement exceeded timeout of {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Unexpected graph response: {reason}")]
    Response { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },

    #[error("Arrow serialization failed: {reason}")]
    Arrow { reason: String },
}

pub type Result<T> = std::result::Result<T, IngestionError>;

impl From<serde_json::Error> for IngestionError {
    fn from(err: serde_json::Error) -> Self {
        IngestionError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for IngestionError {
    fn from(err: serde_yaml::Error) -> Self {
        IngestionError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl From<arrow::error::ArrowError> for IngestionError {
    fn from(err: arrow::error::ArrowError) -> Self {
        IngestionError::Serialization(SerializationError::Arrow {
            reason: err.to_string(),
        })
    }
}

impl From<neo4rs::Error> for GraphError {
    fn from(err: neo4rs::Error) -> Self {
        GraphError::Statement {
            reason: err.to_string(),
        }
    }
}

impl IngestionError {
    /// Errors that must abort the whole run rather than skip a window.
    pub fn is_fatal(&self) -> bool {
        !self.should_skip_window()
    }

    /// Per-window fetch failures are logged and the loop advances.
    pub fn should_skip_window(&self) -> bool {
        matches!(self, IngestionError::Source(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestionError::Cancelled { .. })
    }
}
