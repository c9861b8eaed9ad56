use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use super::{GraphStore, Param, ParamRow, Statement, StatementKind};
use crate::errors::GraphError;
use crate::hydration::HydrationStatus;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostNode {
    pub hydrated: HydrationStatus,
    pub properties: BTreeMap<String, Param>,
}

/// Full contents of a [`MemoryGraphStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub posts: BTreeMap<i64, PostNode>,
    pub accounts: BTreeMap<i64, BTreeMap<String, Param>>,
    pub urls: BTreeMap<String, BTreeMap<String, Param>>,
    /// `(from, relationship, to)` with nodes written as `Label:key`.
    pub edges: BTreeSet<(String, &'static str, String)>,
}

/// In-process graph store applying the same merge semantics as the Cypher
/// statements. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: Mutex<GraphSnapshot>,
    statement_sizes: Mutex<Vec<usize>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a post node with the given status.
    pub fn insert_post(&self, id: i64, hydrated: HydrationStatus) {
        let mut state = self.lock_state();
        state.posts.entry(id).or_default().hydrated = hydrated;
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.lock_state().clone()
    }

    /// Row count of every statement run so far, in order.
    pub fn statement_sizes(&self) -> Vec<usize> {
        self.statement_sizes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GraphSnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn int(row: &ParamRow, key: &str) -> Result<i64, GraphError> {
    match row.get(key) {
        Some(Param::Int(v)) => Ok(*v),
        other => Err(GraphError::Statement {
            reason: format!("expected integer parameter '{key}', got {other:?}"),
        }),
    }
}

fn text(row: &ParamRow, key: &str) -> Result<String, GraphError> {
    match row.get(key) {
        Some(Param::Text(v)) => Ok(v.clone()),
        other => Err(GraphError::Statement {
            reason: format!("expected text parameter '{key}', got {other:?}"),
        }),
    }
}

fn properties(row: &ParamRow, keys: &[&str]) -> BTreeMap<String, Param> {
    keys.iter()
        .map(|k| (k.to_string(), row.get(k).cloned().unwrap_or(Param::Null)))
        .collect()
}

fn post_key(id: i64) -> String {
    format!("Post:{id}")
}

fn account_key(id: i64) -> String {
    format!("Account:{id}")
}

/// One validated statement row, ready to merge.
enum Change {
    Post {
        id: i64,
        properties: BTreeMap<String, Param>,
    },
    Author {
        rel: &'static str,
        post_id: i64,
        account_id: i64,
        properties: BTreeMap<String, Param>,
    },
    Link {
        rel: &'static str,
        post_id: i64,
        target_id: i64,
    },
    Mention {
        rel: &'static str,
        post_id: i64,
        account_id: i64,
        properties: BTreeMap<String, Param>,
    },
    Url {
        rel: &'static str,
        post_id: i64,
        full_url: String,
        properties: BTreeMap<String, Param>,
    },
}

impl Change {
    fn parse(kind: StatementKind, row: &ParamRow) -> Result<Self, GraphError> {
        let rel = kind.relationship().unwrap_or_default();
        Ok(match kind {
            StatementKind::MergePosts => Change::Post {
                id: int(row, "id")?,
                properties: properties(
                    row,
                    &["text", "created_at", "lang", "favorite_count", "repost_count", "possibly_sensitive", "kind"],
                ),
            },
            StatementKind::MergeAuthors => Change::Author {
                rel,
                post_id: int(row, "post_id")?,
                account_id: int(row, "account_id")?,
                properties: properties(row, &["screen_name", "name", "followers_count", "verified"]),
            },
            StatementKind::MergeReplies | StatementKind::MergeQuotes | StatementKind::MergeReposts => Change::Link {
                rel,
                post_id: int(row, "post_id")?,
                target_id: int(row, "target_id")?,
            },
            StatementKind::MergeMentions => Change::Mention {
                rel,
                post_id: int(row, "post_id")?,
                account_id: int(row, "account_id")?,
                properties: properties(row, &["screen_name"]),
            },
            StatementKind::MergeUrls => Change::Url {
                rel,
                post_id: int(row, "post_id")?,
                full_url: text(row, "full_url")?,
                properties: properties(row, &["scheme", "host", "port", "path", "query", "fragment"]),
            },
        })
    }
}

impl GraphSnapshot {
    fn apply(&mut self, change: Change) {
        match change {
            Change::Post { id, properties } => {
                let post = self.posts.entry(id).or_default();
                post.properties.extend(properties);
                post.hydrated = HydrationStatus::Full;
            }
            // Relationship statements MATCH the source post first.
            Change::Author { post_id, .. }
            | Change::Link { post_id, .. }
            | Change::Mention { post_id, .. }
            | Change::Url { post_id, .. }
                if !self.posts.contains_key(&post_id) => {}
            Change::Author {
                rel,
                post_id,
                account_id,
                properties,
            } => {
                self.accounts.entry(account_id).or_default().extend(properties);
                self.edges.insert((account_key(account_id), rel, post_key(post_id)));
            }
            Change::Link { rel, post_id, target_id } => {
                self.posts.entry(target_id).or_insert_with(|| PostNode {
                    hydrated: HydrationStatus::Partial,
                    properties: BTreeMap::new(),
                });
                self.edges.insert((post_key(post_id), rel, post_key(target_id)));
            }
            Change::Mention {
                rel,
                post_id,
                account_id,
                properties,
            } => {
                self.accounts.entry(account_id).or_insert(properties);
                self.edges.insert((post_key(post_id), rel, account_key(account_id)));
            }
            Change::Url {
                rel,
                post_id,
                full_url,
                properties,
            } => {
                self.edges.insert((post_key(post_id), rel, format!("Url:{full_url}")));
                self.urls.entry(full_url).or_insert(properties);
            }
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn run(&self, statement: Statement<'_>) -> Result<(), GraphError> {
        // Every row is checked before any is merged, so a bad row leaves the
        // store untouched like a rolled back transaction.
        let changes = statement
            .rows
            .iter()
            .map(|row| Change::parse(statement.kind, row))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.lock_state();
        for change in changes {
            state.apply(change);
        }
        drop(state);

        self.statement_sizes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(statement.rows.len());
        Ok(())
    }

    async fn hydration_status(&self, ids: &[i64]) -> Result<HashMap<i64, HydrationStatus>, GraphError> {
        let state = self.lock_state();
        Ok(ids
            .iter()
            .filter_map(|id| state.posts.get(id).map(|p| (*id, p.hydrated)))
            .collect())
    }
}
