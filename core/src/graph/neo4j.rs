use async_trait::async_trait;
use neo4rs::{BoltBoolean, BoltInteger, BoltMap, BoltNull, BoltString, BoltType, ConfigBuilder, Graph, query};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{GraphStore, HYDRATION_STATUS, Param, ParamRow, Statement};
use crate::config::GraphConfig;
use crate::errors::GraphError;
use crate::hydration::HydrationStatus;

/// Graph store speaking bolt to a Neo4j-compatible server.
#[derive(Clone)]
pub struct Neo4jGraphStore {
    graph: Graph,
    statement_timeout: Duration,
}

impl Neo4jGraphStore {
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let connection_error = |e: neo4rs::Error| GraphError::Connection {
            uri: config.uri.clone(),
            reason: e.to_string(),
        };
        let neo4j_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.user.as_str())
            .password(config.password.as_str())
            .fetch_size(500)
            .max_connections(4)
            .build()
            .map_err(connection_error)?;
        let graph = Graph::connect(neo4j_config).await.map_err(connection_error)?;
        info!("Connected to graph store at {}", config.uri);

        Ok(Self {
            graph,
            statement_timeout: Duration::from_secs(config.statement_timeout_secs),
        })
    }

    async fn within_timeout<T>(
        &self,
        work: impl Future<Output = Result<T, neo4rs::Error>>,
    ) -> Result<T, GraphError> {
        match timeout(self.statement_timeout, work).await {
            Ok(result) => result.map_err(GraphError::from),
            Err(_) => Err(GraphError::Timeout {
                timeout_secs: self.statement_timeout.as_secs(),
            }),
        }
    }
}

fn param_to_bolt(param: &Param) -> BoltType {
    match param {
        Param::Int(v) => BoltType::Integer(BoltInteger::new(*v)),
        Param::Text(v) => BoltType::String(BoltString::from(v.as_str())),
        Param::Bool(v) => BoltType::Boolean(BoltBoolean::new(*v)),
        Param::Null => BoltType::Null(BoltNull),
    }
}

fn row_to_bolt(row: &ParamRow) -> BoltType {
    BoltType::Map(BoltMap::from_iter(
        row.iter()
            .map(|(key, value)| (BoltString::from(*key), param_to_bolt(value))),
    ))
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn run(&self, statement: Statement<'_>) -> Result<(), GraphError> {
        let rows: Vec<BoltType> = statement.rows.iter().map(row_to_bolt).collect();
        let q = query(statement.text()).param("rows", rows);

        self.within_timeout(async {
            let mut txn = self.graph.start_txn().await?;
            txn.run(q).await?;
            txn.commit().await
        })
        .await?;

        debug!("Ran {:?} with {} rows", statement.kind, statement.rows.len());
        Ok(())
    }

    async fn hydration_status(&self, ids: &[i64]) -> Result<HashMap<i64, HydrationStatus>, GraphError> {
        let q = query(HYDRATION_STATUS).param("ids", ids.to_vec());

        let rows = self
            .within_timeout(async {
                let mut stream = self.graph.execute(q).await?;
                let mut rows = Vec::new();
                while let Some(row) = stream.next().await? {
                    rows.push(row);
                }
                Ok(rows)
            })
            .await?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id").map_err(|e| GraphError::Response {
                reason: format!("missing id column: {e}"),
            })?;
            let hydrated: String = row.get("hydrated").map_err(|e| GraphError::Response {
                reason: format!("missing hydrated column: {e}"),
            })?;
            statuses.insert(id, HydrationStatus::from_marker(&hydrated));
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_become_bolt_maps() {
        let row = ParamRow::from([
            ("id", Param::Int(7)),
            ("lang", Param::Text("en".to_string())),
            ("possibly_sensitive", Param::Bool(false)),
            ("created_at", Param::Null),
        ]);

        let BoltType::Map(map) = row_to_bolt(&row) else {
            panic!("expected a bolt map");
        };
        assert_eq!(map.value.len(), 4);
        assert_eq!(
            map.value.get(&BoltString::from("id")),
            Some(&BoltType::Integer(BoltInteger::new(7)))
        );
        assert_eq!(
            map.value.get(&BoltString::from("created_at")),
            Some(&BoltType::Null(BoltNull))
        );
    }
}
