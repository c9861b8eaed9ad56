use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

use super::{FlushContext, Sink};
use crate::errors::SinkError;
use crate::graph::GraphBatchWriter;

/// Adapts a [`GraphBatchWriter`] to the sink contract.
pub struct GraphSink {
    writer: GraphBatchWriter,
}

impl GraphSink {
    pub fn new(writer: GraphBatchWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Sink for GraphSink {
    fn name(&self) -> &str {
        "graph"
    }

    async fn write(&mut self, batch: &RecordBatch, _ctx: &FlushContext) -> Result<(), SinkError> {
        self.writer
            .write(batch)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Write {
                sink: "graph".to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
