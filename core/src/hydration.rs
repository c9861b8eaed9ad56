use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::errors::GraphError;
use crate::graph::GraphStore;
use crate::record::Record;

/// How much of an item the graph holds. Ordered; a status only ever rises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HydrationStatus {
    /// No persisted entity.
    #[default]
    Missing,
    /// Referenced by another item but never fetched itself.
    Partial,
    Full,
}

impl HydrationStatus {
    /// Reads the marker stored on graph nodes. Any node that exists but is
    /// not marked `FULL` counts as partial.
    pub fn from_marker(marker: &str) -> Self {
        if marker.eq_ignore_ascii_case("FULL") {
            HydrationStatus::Full
        } else {
            HydrationStatus::Partial
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HydrationStatus::Missing => "MISSING",
            HydrationStatus::Partial => "PARTIAL",
            HydrationStatus::Full => "FULL",
        }
    }
}

#[async_trait]
pub trait HydrationStatusOracle: Send + Sync {
    /// Status of each id that has a persisted entity; absent ids are missing.
    async fn status(&self, ids: &[i64]) -> Result<HashMap<i64, HydrationStatus>, GraphError>;
}

#[async_trait]
impl<S: GraphStore + ?Sized> HydrationStatusOracle for S {
    async fn status(&self, ids: &[i64]) -> Result<HashMap<i64, HydrationStatus>, GraphError> {
        self.hydration_status(ids).await
    }
}

/// Drops ids that are already fully persisted before they are fetched again.
///
/// Every id seen as `Full`, and every id this run flushed, is remembered so it
/// is never returned again even if a later lookup disagrees.
pub struct RehydrationDedupFilter {
    oracle: Arc<dyn HydrationStatusOracle>,
    batch_size: usize,
    known_full: HashSet<i64>,
}

impl RehydrationDedupFilter {
    pub fn new(oracle: Arc<dyn HydrationStatusOracle>, batch_size: usize) -> Self {
        Self {
            oracle,
            batch_size: batch_size.max(1),
            known_full: HashSet::new(),
        }
    }

    /// Ids whose status is not `Full`, de-duplicated, in input order.
    pub async fn needs_fetch(&mut self, ids: &[i64]) -> Result<Vec<i64>, GraphError> {
        let mut seen = HashSet::with_capacity(ids.len());
        let candidates: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id) && !self.known_full.contains(id))
            .collect();

        let mut pending = Vec::with_capacity(candidates.len());
        for chunk in candidates.chunks(self.batch_size) {
            let statuses = self.oracle.status(chunk).await?;
            for id in chunk {
                match statuses.get(id).copied().unwrap_or_default() {
                    HydrationStatus::Full => {
                        self.known_full.insert(*id);
                    }
                    HydrationStatus::Missing | HydrationStatus::Partial => pending.push(*id),
                }
            }
        }

        debug!(
            "{} of {} ids need fetching",
            pending.len(),
            ids.len()
        );
        Ok(pending)
    }

    /// Keeps records whose id still needs fetching. Records without an id
    /// pass through. Returns the kept records and the number dropped.
    pub async fn retain_unhydrated(&mut self, records: Vec<Record>) -> Result<(Vec<Record>, usize), GraphError> {
        let ids: Vec<i64> = records.iter().filter_map(Record::id).collect();
        if ids.is_empty() {
            return Ok((records, 0));
        }
        let pending: HashSet<i64> = self.needs_fetch(&ids).await?.into_iter().collect();

        let total = records.len();
        let mut emitted = HashSet::new();
        let kept: Vec<Record> = records
            .into_iter()
            .filter(|record| match record.id() {
                Some(id) => pending.contains(&id) && emitted.insert(id),
                None => true,
            })
            .collect();
        let dropped = total - kept.len();
        Ok((kept, dropped))
    }

    pub fn mark_full(&mut self, ids: impl IntoIterator<Item = i64>) {
        self.known_full.extend(ids);
    }

    pub fn is_known_full(&self, id: i64) -> bool {
        self.known_full.contains(&id)
    }

    pub fn known_full_count(&self) -> usize {
        self.known_full.len()
    }
}
