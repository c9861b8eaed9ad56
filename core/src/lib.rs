pub mod accumulator;
pub mod config;
pub mod errors;
pub mod graph;
pub mod hydration;
pub mod ingestor;
pub mod normalize;
pub mod record;
pub mod schema;
pub mod sink;
pub mod snowflake;
pub mod source;
pub mod telemetry;
pub mod window;

#[cfg(test)]
mod testing;

pub use config::IngestConfig;
pub use errors::{IngestionError, Result};
pub use ingestor::{JobState, RetrievalLoop, RetrievalPlan};
